//! TCP listener and connector.
//!
//! # Example
//!
//! ```ignore
//! use queuewire::transport::TcpTransportListener;
//!
//! let listener = TcpTransportListener::bind("127.0.0.1:0", true).await?;
//! let (stream, peer) = listener.accept().await?;
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{QueueWireError, Result};

/// Listening TCP socket that applies the no-delay option to accepted streams.
#[derive(Debug)]
pub struct TcpTransportListener {
    listener: TcpListener,
    nodelay: bool,
}

impl TcpTransportListener {
    /// Bind to an address such as `"0.0.0.0:25565"`.
    pub async fn bind(addr: impl ToSocketAddrs, nodelay: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, nodelay })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok((stream, peer))
    }

    /// Get the bound address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Connect to `addr`, failing with `Timeout` after `timeout`.
pub async fn connect(
    addr: impl ToSocketAddrs,
    timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| QueueWireError::Timeout)??;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let listener = TcpTransportListener::bind("127.0.0.1:0", true).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _peer) = listener.accept().await.unwrap();
            assert!(stream.nodelay().unwrap());
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = connect(addr, Duration::from_secs(5), true).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpTransportListener::bind("127.0.0.1:0", false).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, Duration::from_secs(5), false).await;
        assert!(matches!(result, Err(QueueWireError::Io(_))));
    }
}
