use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::protocol::{Command, Frame};
use crate::utils::error::{DriverError, Result};

/// Where encoded commands go. Implemented by the connection manager.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Resolved by the next data frame.
    Register,
    /// Resolved by a data frame or by an error frame carrying `reply`.
    Loopback { reply: u8 },
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub address: u8,
    pub kind: RequestKind,
    pub issued_at: Instant,
    pub timeout: Duration,
    completion: oneshot::Sender<Result<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Resolved { id: u64, address: u8, elapsed: Duration },
    /// A data frame arrived with nothing waiting for it.
    Unsolicited { value: u8 },
    /// An error frame that no request was waiting for.
    Advisory { code: u8 },
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<PendingRequest>,
    next_id: u64,
}

/// Matches decoded frames to outstanding requests, oldest first.
///
/// Nothing on the wire says which request a reply belongs to, so `submit`
/// only lets one request out at a time. Later callers queue on `slot` in
/// arrival order.
#[derive(Debug, Clone, Default)]
pub struct RequestCorrelator {
    queue: Arc<Mutex<Queue>>,
    slot: Arc<AsyncMutex<()>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends `command` and waits for its reply, the timeout, or a link loss.
    pub async fn submit(
        &self,
        sink: &dyn CommandSink,
        command: Command,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<u8> {
        let _slot = self.slot.lock().await;

        let (id, mut completion) = self.enqueue(command.address, kind, timeout);
        if let Err(e) = sink.send_command(&command.to_bytes()).await {
            self.cancel(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut completion).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DriverError::ChannelClosed),
            Err(_) => {
                if !self.cancel(id) {
                    // Resolved in the window between the deadline and the cancel.
                    if let Ok(outcome) = completion.try_recv() {
                        return outcome;
                    }
                }
                debug!("Request #{} for register {} timed out", id, command.address);
                Err(DriverError::Timeout {
                    address: command.address,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn enqueue(
        &self,
        address: u8,
        kind: RequestKind,
        timeout: Duration,
    ) -> (u64, oneshot::Receiver<Result<u8>>) {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue();
        queue.next_id += 1;
        let id = queue.next_id;
        queue.pending.push_back(PendingRequest {
            id,
            address,
            kind,
            issued_at: Instant::now(),
            timeout,
            completion: tx,
        });
        (id, rx)
    }

    pub fn on_frame(&self, frame: Frame) -> FrameOutcome {
        let mut queue = self.queue();
        queue.pending.retain(|request| !request.completion.is_closed());

        let accepts = match (frame, queue.pending.front()) {
            (Frame::Data { .. }, Some(_)) => true,
            (Frame::Error { code }, Some(request)) => {
                request.kind == RequestKind::Loopback { reply: code }
            }
            (_, None) => false,
        };

        let value = match frame {
            Frame::Data { value } => value,
            Frame::Error { code } => code,
        };

        if !accepts {
            return match frame {
                Frame::Data { value } => FrameOutcome::Unsolicited { value },
                Frame::Error { code } => FrameOutcome::Advisory { code },
            };
        }

        match queue.pending.pop_front() {
            Some(request) => {
                let outcome = FrameOutcome::Resolved {
                    id: request.id,
                    address: request.address,
                    elapsed: request.issued_at.elapsed(),
                };
                if request.completion.send(Ok(value)).is_err() {
                    warn!("Request #{} was abandoned before its reply arrived", request.id);
                }
                outcome
            }
            None => FrameOutcome::Unsolicited { value },
        }
    }

    /// Removes a request without resolving it. Returns false if it was already gone.
    pub fn cancel(&self, id: u64) -> bool {
        let mut queue = self.queue();
        match queue.pending.iter().position(|request| request.id == id) {
            Some(index) => {
                queue.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Rejects every outstanding request with `error`.
    pub fn fail_all(&self, error: DriverError) -> usize {
        let drained: Vec<PendingRequest> = self.queue().pending.drain(..).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.completion.send(Err(error.clone()));
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        self.queue().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemorySpace;
    use tokio::sync::mpsc;

    struct RecordingSink {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&self, bytes: &[u8]) -> Result<()> {
            let _ = self.tx.send(bytes.to_vec());
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl CommandSink for ClosedSink {
        async fn send_command(&self, _bytes: &[u8]) -> Result<()> {
            Err(DriverError::ConnectionError("channel not open".to_string()))
        }
    }

    fn recording_sink() -> (Arc<RecordingSink>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingSink { tx }), rx)
    }

    async fn wait_for_outstanding(correlator: &RequestCorrelator, count: usize) {
        for _ in 0..200 {
            if correlator.outstanding() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} outstanding request(s)", count);
    }

    #[tokio::test]
    async fn test_data_frame_resolves_pending_read() {
        let correlator = RequestCorrelator::new();
        let (sink, mut sent) = recording_sink();

        let task = {
            let correlator = correlator.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                correlator
                    .submit(
                        sink.as_ref(),
                        Command::read(MemorySpace::Ram, 50),
                        RequestKind::Register,
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        assert_eq!(sent.recv().await.unwrap(), vec![20, 50, 0, 217]);
        wait_for_outstanding(&correlator, 1).await;
        let outcome = correlator.on_frame(Frame::Data { value: 138 });
        assert!(matches!(outcome, FrameOutcome::Resolved { address: 50, .. }));
        assert_eq!(task.await.unwrap(), Ok(138));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_request_and_late_frame_is_dropped() {
        let correlator = RequestCorrelator::new();
        let (sink, _sent) = recording_sink();

        let started = Instant::now();
        let result = correlator
            .submit(
                sink.as_ref(),
                Command::read(MemorySpace::Ram, 50),
                RequestKind::Register,
                Duration::from_millis(100),
            )
            .await;

        assert_eq!(result, Err(DriverError::Timeout { address: 50, timeout_ms: 100 }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(correlator.outstanding(), 0);
        assert_eq!(
            correlator.on_frame(Frame::Data { value: 9 }),
            FrameOutcome::Unsolicited { value: 9 }
        );
    }

    #[tokio::test]
    async fn test_error_frame_does_not_resolve_register_read() {
        let correlator = RequestCorrelator::new();
        let (sink, mut sent) = recording_sink();

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .submit(
                        sink.as_ref(),
                        Command::read(MemorySpace::Ram, 181),
                        RequestKind::Register,
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        sent.recv().await.unwrap();
        wait_for_outstanding(&correlator, 1).await;
        assert_eq!(
            correlator.on_frame(Frame::Error { code: 0x82 }),
            FrameOutcome::Advisory { code: 0x82 }
        );
        assert_eq!(correlator.outstanding(), 1);
        correlator.on_frame(Frame::Data { value: 77 });
        assert_eq!(task.await.unwrap(), Ok(77));
    }

    #[tokio::test]
    async fn test_loopback_resolved_by_reply_code() {
        let correlator = RequestCorrelator::new();
        let (sink, mut sent) = recording_sink();

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .submit(
                        sink.as_ref(),
                        Command::loopback(),
                        RequestKind::Loopback { reply: 0x80 },
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        sent.recv().await.unwrap();
        wait_for_outstanding(&correlator, 1).await;
        assert!(matches!(
            correlator.on_frame(Frame::Error { code: 0x81 }),
            FrameOutcome::Advisory { code: 0x81 }
        ));
        assert!(matches!(
            correlator.on_frame(Frame::Error { code: 0x80 }),
            FrameOutcome::Resolved { .. }
        ));
        assert_eq!(task.await.unwrap(), Ok(0x80));
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let correlator = RequestCorrelator::new();
        let (sink, mut sent) = recording_sink();

        let mut tasks = Vec::new();
        for address in [50u8, 53u8] {
            let correlator = correlator.clone();
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                correlator
                    .submit(
                        sink.as_ref(),
                        Command::read(MemorySpace::Ram, address),
                        RequestKind::Register,
                        Duration::from_secs(2),
                    )
                    .await
            }));
            // Fix arrival order at the slot.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = sent.recv().await.unwrap();
        assert_eq!(first[1], 50);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sent.try_recv().is_err(), "second command went out while first was in flight");
        assert_eq!(correlator.outstanding(), 1);

        correlator.on_frame(Frame::Data { value: 130 });
        let second = sent.recv().await.unwrap();
        assert_eq!(second[1], 53);
        wait_for_outstanding(&correlator, 1).await;
        correlator.on_frame(Frame::Data { value: 36 });

        let results: Vec<Result<u8>> = vec![
            tasks.remove(0).await.unwrap(),
            tasks.remove(0).await.unwrap(),
        ];
        assert_eq!(results, vec![Ok(130), Ok(36)]);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_channel_closed() {
        let correlator = RequestCorrelator::new();
        let (sink, mut sent) = recording_sink();

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .submit(
                        sink.as_ref(),
                        Command::read(MemorySpace::Ram, 50),
                        RequestKind::Register,
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        sent.recv().await.unwrap();
        wait_for_outstanding(&correlator, 1).await;
        assert_eq!(correlator.fail_all(DriverError::ChannelClosed), 1);
        assert_eq!(task.await.unwrap(), Err(DriverError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_pending_request() {
        let correlator = RequestCorrelator::new();
        let result = correlator
            .submit(
                &ClosedSink,
                Command::read(MemorySpace::Ram, 50),
                RequestKind::Register,
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(DriverError::ConnectionError(_))));
        assert_eq!(correlator.outstanding(), 0);
    }
}
