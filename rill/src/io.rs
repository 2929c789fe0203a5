//! Socket plumbing: timed reads/writes over the cooperative context and the
//! optional TLS acceptor for RTMPS.

use bytes::BytesMut;
use runtime::CoroutineContext;
use shared::error::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads some bytes with a timeout; zero bytes means the peer closed.
pub async fn read_some<S: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<usize> {
    let mut chunk = [0u8; 16 * 1024];
    let n = ctx.timeout(timeout, stream.read(&mut chunk)).await?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Reads exactly `n` bytes with a timeout.
pub async fn read_exact<S: AsyncRead + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    n: usize,
    timeout: Duration,
) -> Result<BytesMut> {
    let mut buf = BytesMut::zeroed(n);
    ctx.timeout(timeout, stream.read_exact(&mut buf)).await?;
    Ok(buf)
}

/// Writes the whole buffer with a timeout.
pub async fn write_all<S: AsyncWrite + Unpin>(
    ctx: &CoroutineContext,
    stream: &mut S,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    ctx.timeout(timeout, stream.write_all(data)).await?;
    Ok(())
}

/// TLS acceptor wrapper for the RTMPS listener.
pub struct TlsWrapper {
    acceptor: tokio_native_tls::TlsAcceptor,
}

impl TlsWrapper {
    /// Loads a PKCS#8 PEM cert/key pair.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert = std::fs::read(cert_path)?;
        let key = std::fs::read(key_path)?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|e| Error::ConfigInvalid(format!("tls identity: {e}")))?;
        let acceptor = native_tls::TlsAcceptor::new(identity)
            .map_err(|e| Error::ConfigInvalid(format!("tls acceptor: {e}")))?;
        Ok(Self {
            acceptor: tokio_native_tls::TlsAcceptor::from(acceptor),
        })
    }

    pub async fn accept(
        &self,
        stream: tokio::net::TcpStream,
    ) -> Result<tokio_native_tls::TlsStream<tokio::net::TcpStream>> {
        self.acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Internal(format!("tls accept: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::Coroutine;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        LocalSet::new()
            .run_until(async {
                let (mut a, mut b) = tokio::io::duplex(1024);
                let co = Coroutine::new("io-test");
                co.start(move |ctx| async move {
                    write_all(&ctx, &mut a, b"hello", Duration::from_secs(1)).await?;
                    let got = read_exact(&ctx, &mut a, 2, Duration::from_secs(1)).await?;
                    assert_eq!(&got[..], b"ok");
                    Ok(())
                });

                let mut buf = [0u8; 5];
                b.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"hello");
                b.write_all(b"ok").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                co.stop().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_read_some_detects_close() {
        LocalSet::new()
            .run_until(async {
                let (mut a, b) = tokio::io::duplex(64);
                drop(b);
                let co = Coroutine::new("io-close");
                co.start(move |ctx| async move {
                    let mut buf = BytesMut::new();
                    let r = read_some(&ctx, &mut a, &mut buf, Duration::from_secs(1)).await;
                    assert!(matches!(r, Err(Error::ConnectionClosed)));
                    Ok(())
                });
                co.stop().await;
            })
            .await;
    }
}
