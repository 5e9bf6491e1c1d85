use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any byte-oriented duplex stream the driver can talk to the controller over.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedChannel = Box<dyn Channel>;

/// Opens a fresh channel for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> std::io::Result<BoxedChannel>;

    /// Human-readable endpoint used in log lines.
    fn describe(&self) -> String;
}

/// TCP link to the serial-to-network relay sitting next to the controller.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("{}:{}", host, port),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxedChannel> {
        debug!("Opening TCP channel to {}", self.endpoint);
        let stream = TcpStream::connect(&self.endpoint).await?;
        // Commands are four bytes; don't let Nagle hold them back.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[0xC8, buf[1]]).await.unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", port);
        assert_eq!(connector.describe(), format!("tcp://127.0.0.1:{}", port));

        let mut channel = connector.connect().await.unwrap();
        channel.write_all(&[20, 50, 0, 217]).await.unwrap();
        let mut reply = [0u8; 2];
        channel.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0xC8, 50]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new("127.0.0.1", port);
        assert!(connector.connect().await.is_err());
    }
}
