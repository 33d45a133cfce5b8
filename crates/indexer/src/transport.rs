//! Line-framed transport over a persistent TCP (optionally TLS) connection.
//!
//! One background reader task owns the read half of the connection and emits
//! whole `0x0a`-delimited lines. Writes go through a connection-level mutex;
//! a write failure on a closed socket triggers exactly one atomic re-dial and
//! retry, handing the reader task the fresh read half. A clean EOF from the
//! server surfaces as a terminal [`TransportError::ConnectionClosed`] on the
//! error channel; the reader then parks until a re-dial (or shutdown) gives
//! it a new connection to resume on.

use std::{io, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use tracing::{debug, warn};

use crate::{error::TransportError, shutdown::ShutdownListener};

/// Message delimiter for the Electrum wire protocol.
pub(crate) const DELIMITER: u8 = b'\n';

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A plain TCP stream or its TLS wrap, erased so both halves share one type.
type IoStream = Box<dyn RawStream>;

type Reader = ReadHalf<IoStream>;
type Writer = WriteHalf<IoStream>;

/// Handle for sending framed messages. Reading happens on the background
/// task spawned by [`Transport::connect`].
#[derive(Debug)]
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    host: String,
    addr: String,
    use_tls: bool,
    writer: Mutex<Writer>,
    /// Hands freshly dialed read halves to the reader task.
    read_half_tx: mpsc::UnboundedSender<Reader>,
    debug: bool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("addr", &self.addr)
            .field("use_tls", &self.use_tls)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Dials `host:port` and spawns the background reader. Returns the send
    /// handle plus the line and error channels fed by the reader.
    pub async fn connect(
        host: &str,
        port: &str,
        use_tls: bool,
        debug: bool,
        shutdown: ShutdownListener,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<Vec<u8>>,
            mpsc::UnboundedReceiver<TransportError>,
        ),
        TransportError,
    > {
        let addr = format!("{host}:{port}");
        let stream = dial(host, &addr, use_tls).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (read_half_tx, read_half_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            host: host.to_string(),
            addr,
            use_tls,
            writer: Mutex::new(write_half),
            read_half_tx,
            debug,
        });

        tokio::spawn(reader_task(
            shared.clone(),
            read_half,
            read_half_rx,
            lines_tx,
            errors_tx,
            shutdown,
        ));

        Ok((Self { shared }, lines_rx, errors_rx))
    }

    /// Writes one already-framed message. Recovers a closed connection once
    /// by re-dialing and retrying; a second failure surfaces. Abandons
    /// promptly with [`TransportError::Cancelled`] on shutdown.
    pub async fn send(
        &self,
        body: &[u8],
        shutdown: &ShutdownListener,
    ) -> Result<(), TransportError> {
        let mut shutdown = shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => Err(TransportError::Cancelled),
            res = self.send_inner(body) => res,
        }
    }

    async fn send_inner(&self, body: &[u8]) -> Result<(), TransportError> {
        if self.shared.debug {
            debug!(addr = %self.shared.addr, len = body.len(), "sending message");
        }
        {
            let mut writer = self.shared.writer.lock().await;
            match write_all(&mut writer, body).await {
                Ok(()) => return Ok(()),
                Err(e) if is_connection_closed(&e) => {
                    warn!(err = %e, "connection closed while sending, re-dialing");
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        self.shared.reconnect().await?;

        let mut writer = self.shared.writer.lock().await;
        write_all(&mut writer, body)
            .await
            .map_err(TransportError::Io)
    }
}

impl Shared {
    /// Re-dials the original address (re-applying TLS), swaps the write half
    /// under the connection mutex, and hands the reader task the new read
    /// half.
    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let stream = dial(&self.host, &self.addr, self.use_tls).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        *writer = write_half;
        let _ = self.read_half_tx.send(read_half);
        debug!(addr = %self.addr, "re-established indexer connection");
        Ok(())
    }
}

async fn write_all(writer: &mut Writer, body: &[u8]) -> io::Result<()> {
    writer.write_all(body).await?;
    writer.flush().await
}

async fn dial(host: &str, addr: &str, use_tls: bool) -> Result<IoStream, TransportError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            source: e,
        })?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidServerName(host.to_string()))?;
    let stream = tls_connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            source: e,
        })?;
    Ok(Box::new(stream))
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Write failures meaning the connection is gone and a re-dial may help.
fn is_connection_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Background reader: owns the read half, emits whole lines, re-dials on a
/// closed-socket signal, and surfaces EOF as a terminal error before parking
/// for a possible write-path re-dial.
async fn reader_task(
    shared: Arc<Shared>,
    first_half: Reader,
    mut read_half_rx: mpsc::UnboundedReceiver<Reader>,
    lines_tx: mpsc::UnboundedSender<Vec<u8>>,
    errors_tx: mpsc::UnboundedSender<TransportError>,
    mut shutdown: ShutdownListener,
) {
    let mut reader = BufReader::new(first_half);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.wait_for_shutdown() => {
                debug!("transport reader exiting on shutdown");
                return;
            }
            // The write path re-dialed; resume on the fresh connection.
            Some(half) = read_half_rx.recv() => {
                reader = BufReader::new(half);
                continue;
            }
            res = reader.read_until(DELIMITER, &mut buf) => res,
        };

        match read {
            Ok(0) => {
                // Clean EOF. A replacement half may already be queued if a
                // concurrent send re-dialed; otherwise this is terminal for
                // in-flight requests and we wait for a new connection.
                if let Ok(half) = read_half_rx.try_recv() {
                    reader = BufReader::new(half);
                    continue;
                }
                let _ = errors_tx.send(TransportError::ConnectionClosed);
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for_shutdown() => return,
                    half = read_half_rx.recv() => match half {
                        Some(half) => reader = BufReader::new(half),
                        None => return,
                    },
                }
            }
            Ok(_) => {
                if shared.debug {
                    debug!(addr = %shared.addr, len = buf.len(), "read message");
                }
                if lines_tx.send(std::mem::take(&mut buf)).is_err() {
                    // Receiver gone: the client was dropped.
                    return;
                }
            }
            Err(e) if is_connection_closed(&e) => {
                warn!(err = %e, "read failed on closed socket, re-dialing");
                match shared.reconnect().await {
                    // The new half arrives through the channel and is picked
                    // up at the top of the loop.
                    Ok(()) => {}
                    Err(e) => {
                        let _ = errors_tx.send(e);
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = errors_tx.send(TransportError::Io(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::{sleep, timeout, Duration},
    };

    use super::*;
    use crate::shutdown::ShutdownSignal;

    async fn bind() -> (TcpListener, String, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        (listener, "127.0.0.1".to_string(), port)
    }

    #[tokio::test]
    async fn test_send_and_read_line() {
        let (listener, host, port) = bind().await;

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping\n");
            socket.write_all(b"pong\n").await.unwrap();
        });

        let signal = ShutdownSignal::new();
        let (transport, mut lines, _errors) =
            Transport::connect(&host, &port, false, false, signal.listener())
                .await
                .unwrap();

        transport.send(b"ping\n", &signal.listener()).await.unwrap();
        let line = timeout(Duration::from_secs(5), lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, b"pong\n");
    }

    #[tokio::test]
    async fn test_eof_surfaces_server_closed_connection() {
        let (listener, host, port) = bind().await;

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let signal = ShutdownSignal::new();
        let (_transport, _lines, mut errors) =
            Transport::connect(&host, &port, false, false, signal.listener())
                .await
                .unwrap();

        let err = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(err.to_string().contains("server closed connection"));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_cancelled() {
        let (listener, host, port) = bind().await;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let signal = ShutdownSignal::new();
        let (transport, _lines, _errors) =
            Transport::connect(&host, &port, false, false, signal.listener())
                .await
                .unwrap();

        signal.trigger();
        let err = transport
            .send(b"ping\n", &signal.listener())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_write_failure_reconnects_once() {
        let (listener, host, port) = bind().await;

        let server = tokio::spawn(async move {
            // First connection is dropped without being read.
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
            // Second connection stays up and records what it receives.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if received.ends_with(b"after-reconnect\n") {
                    break;
                }
            }
            received
        });

        let signal = ShutdownSignal::new();
        let (transport, _lines, _errors) =
            Transport::connect(&host, &port, false, false, signal.listener())
                .await
                .unwrap();

        // Let the FIN (and, after the first write, the RST) arrive.
        sleep(Duration::from_millis(100)).await;
        // First write lands in the dead socket's buffer and provokes an RST.
        let _ = transport.send(b"lost\n", &signal.listener()).await;
        sleep(Duration::from_millis(100)).await;

        // This write fails on the reset socket, re-dials, and is retried.
        transport
            .send(b"after-reconnect\n", &signal.listener())
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(received.ends_with(b"after-reconnect\n"));
    }
}
