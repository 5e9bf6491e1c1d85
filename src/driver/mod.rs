pub mod channel;
pub mod connection;
pub mod correlator;
pub mod session;

pub use channel::{BoxedChannel, Channel, Connector, TcpConnector};
pub use connection::{ConnectionManager, ConnectionState, LinkEvent, LinkSettings, LinkStats};
pub use correlator::{CommandSink, FrameOutcome, RequestCorrelator, RequestKind};
pub use session::{DriverEvent, DriverStats, PlDriver, SolarSnapshot};

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
    use tokio::sync::mpsc;

    use super::channel::{BoxedChannel, Connector};

    /// Hands the far end of an in-memory pipe to the test for every connect.
    pub struct DuplexConnector {
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    impl DuplexConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (peers, rx) = mpsc::unbounded_channel();
            (Self { peers }, rx)
        }
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self) -> io::Result<BoxedChannel> {
            let (local, remote) = tokio::io::duplex(1024);
            self.peers
                .send(remote)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no device"))?;
            Ok(Box::new(local))
        }

        fn describe(&self) -> String {
            "duplex://test".to_string()
        }
    }

    /// Refuses every attempt after a short delay and records overlap.
    #[derive(Default)]
    pub struct RefusingConnector {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RefusingConnector {
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> io::Result<BoxedChannel> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }

        fn describe(&self) -> String {
            "refusing://test".to_string()
        }
    }

    /// Connects fine, then fails the first read.
    pub struct BrokenConnector;

    struct BrokenChannel;

    impl AsyncRead for BrokenChannel {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for BrokenChannel {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Connector for BrokenConnector {
        async fn connect(&self) -> io::Result<BoxedChannel> {
            Ok(Box::new(BrokenChannel))
        }

        fn describe(&self) -> String {
            "broken://test".to_string()
        }
    }
}
