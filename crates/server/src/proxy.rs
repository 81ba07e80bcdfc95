//! TLS relay boundary.
//!
//! The relay is a byte-transparent forwarder with no protocol awareness: it
//! accepts on the secure port (`server_port + 1`), hands the raw stream to a
//! `TlsTerminator`, then shuttles bytes between the terminated channel and
//! the plaintext negotiation listener on loopback. Certificate generation and
//! the TLS stack itself live behind the trait, outside this engine.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use protocol::{AppError, AppResult};

pub trait SecureChannel: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SecureChannel for T {}

/// External collaborator that terminates TLS on an accepted connection.
pub trait TlsTerminator: Send + Sync + 'static {
    fn terminate(
        &self,
        stream: TcpStream,
    ) -> impl Future<Output = AppResult<impl SecureChannel + 'static>> + Send;
}

/// Passthrough terminator for tests and plaintext embeddings.
pub struct PlainTerminator;

impl TlsTerminator for PlainTerminator {
    async fn terminate(&self, stream: TcpStream) -> AppResult<TcpStream> {
        Ok(stream)
    }
}

pub async fn bind_relay_listener(secure_port: u16) -> AppResult<TcpListener> {
    TcpListener::bind(("0.0.0.0", secure_port))
        .await
        .map_err(|error| {
            AppError::new("share_relay_bind_failed", "安全转发端口绑定失败")
                .with_context("port", secure_port.to_string())
                .with_cause(error.to_string())
        })
}

/// Accept loop. Per-connection failures are logged and the loop continues;
/// only the shutdown flag stops it.
pub async fn run_relay_loop<T: TlsTerminator>(
    listener: TcpListener,
    terminator: Arc<T>,
    target_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => {
                let (stream, address) = match accepted {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(
                            event = "share_relay_accept_failed",
                            error = error.to_string()
                        );
                        continue;
                    }
                };

                let terminator = terminator.clone();
                tokio::spawn(async move {
                    if let Err(error) = relay_connection(stream, terminator, target_port).await {
                        tracing::debug!(
                            event = "share_relay_connection_closed",
                            address = address.to_string(),
                            error_code = error.code
                        );
                    }
                });
            }
        }
    }
}

async fn relay_connection<T: TlsTerminator>(
    stream: TcpStream,
    terminator: Arc<T>,
    target_port: u16,
) -> AppResult<()> {
    let mut secure = terminator.terminate(stream).await?;
    let mut inner = TcpStream::connect(("127.0.0.1", target_port))
        .await
        .map_err(|error| {
            AppError::new("share_relay_upstream_failed", "连接内部监听端口失败")
                .with_context("targetPort", target_port.to_string())
                .with_cause(error.to_string())
        })?;

    let _ = copy_bidirectional(&mut secure, &mut inner).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relay_should_forward_bytes_unchanged() {
        // echo server standing in for the plaintext negotiation listener
        let echo = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
        let echo_port = echo.local_addr().expect("echo addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = echo.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    while let Ok(count) = stream.read(&mut buffer).await {
                        if count == 0 {
                            break;
                        }
                        if stream.write_all(&buffer[..count]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let relay = bind_relay_listener(0).await.expect("bind relay");
        let relay_port = relay.local_addr().expect("relay addr").port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_relay_loop(
            relay,
            Arc::new(PlainTerminator),
            echo_port,
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(("127.0.0.1", relay_port))
            .await
            .expect("connect relay");
        client.write_all(b"GET-ish opaque bytes").await.expect("write");
        let mut reply = [0u8; 20];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(&reply, b"GET-ish opaque bytes");

        let _ = shutdown_tx.send(true);
    }
}
