//! TCP echo server.
//!
//! Accepts connections and writes back every byte it reads until the
//! peer closes. Each connection runs on its own task.

use crate::config::ServerConfig;
use crate::load::LoadStats;
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Connection counters
#[derive(Debug, Default)]
pub struct EchoStats {
    accepted: AtomicU64,
    active: AtomicU64,
    bytes_echoed: AtomicU64,
}

/// Point-in-time copy of `EchoStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub bytes_echoed: u64,
}

impl EchoStats {
    pub fn snapshot(&self) -> EchoSnapshot {
        EchoSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
        }
    }
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    stats: Arc<EchoStats>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            stats: Arc::new(EchoStats::default()),
            connection_limit,
        }
    }

    pub fn stats(&self) -> &Arc<EchoStats> {
        &self.stats
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr, self.config.backlog)?;
        TcpListener::from_std(listener)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let read_size = self.config.read_size;

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                }
                _ = &mut shutdown => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);

                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(async move {
                        stats.active.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = handle_connection(stream, &stats, read_size).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        stats.active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Server stopped accepting connections");
        Ok(())
    }
}

/// Echo everything read from `stream` back to it until EOF.
pub async fn handle_connection<S>(
    mut stream: S,
    stats: &EchoStats,
    read_size: usize,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(read_size);

    loop {
        buffer.clear();
        buffer.reserve(read_size);

        let n = (&mut stream).take(read_size as u64).read_buf(&mut buffer).await?;
        if n == 0 {
            trace!("Connection closed by client");
            break;
        }

        stats.bytes_echoed.fetch_add(n as u64, Ordering::Relaxed);
        stream.write_all(&buffer).await?;
    }

    stream.shutdown().await
}

/// Periodically log echo and load counters.
pub async fn report_task(
    echo: Arc<EchoStats>,
    load: Arc<LoadStats>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let echo = echo.snapshot();
        let load = load.snapshot();
        info!(
            accepted = echo.accepted,
            active = echo.active,
            bytes_echoed = echo.bytes_echoed,
            cpu_rounds = load.cpu_rounds,
            allocations = load.allocations,
            held_mb = load.bytes_held / 1024 / 1024,
            "Stats"
        );
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            backlog: 128,
            max_connections: 16,
            read_size: 1024,
            report_interval: 0,
        }
    }

    #[tokio::test]
    async fn test_echo_single_message() {
        let stream = tokio_test::io::Builder::new()
            .read(b"Stress test data")
            .write(b"Stress test data")
            .build();
        let stats = EchoStats::default();

        handle_connection(stream, &stats, 1024).await.unwrap();
        assert_eq!(stats.snapshot().bytes_echoed, 16);
    }

    #[tokio::test]
    async fn test_echo_respects_read_size() {
        let stream = tokio_test::io::Builder::new()
            .read(b"abcdefgh")
            .write(b"abc")
            .write(b"def")
            .write(b"gh")
            .build();
        let stats = EchoStats::default();

        handle_connection(stream, &stats, 3).await.unwrap();
        assert_eq!(stats.snapshot().bytes_echoed, 8);
    }

    #[tokio::test]
    async fn test_echo_binary_bytes() {
        let payload = [0xff, 0x00, 0xfe, b'\r', b'\n', 0x80];
        let stream = tokio_test::io::Builder::new()
            .read(&payload)
            .write(&payload)
            .read(b"more")
            .write(b"more")
            .build();
        let stats = EchoStats::default();

        handle_connection(stream, &stats, 1024).await.unwrap();
        assert_eq!(stats.snapshot().bytes_echoed, 10);
    }

    #[tokio::test]
    async fn test_server_echoes_over_tcp() {
        let server = Arc::new(Server::new(test_config()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            running
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        for _ in 0..3 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            let mut reply = [0u8; 5];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"hello");
        }

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();

        let stats = server.stats().snapshot();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.bytes_echoed, 15);
    }

    #[tokio::test]
    async fn test_large_payload_round_trip() {
        let server = Arc::new(Server::new(test_config()));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run(listener, std::future::pending()).await });

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let sent = payload.clone();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        writer_task.await.unwrap();

        assert_eq!(echoed, payload);
    }

    async fn spawn_server(
        config: ServerConfig,
    ) -> (
        Arc<Server>,
        SocketAddr,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let server = Arc::new(Server::new(config));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            running
                .run(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });
        (server, addr, stop_tx, task)
    }

    async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        let mut reply = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, payload);
    }

    #[tokio::test]
    async fn test_echo_read_error_is_returned() {
        let stream = tokio_test::io::Builder::new()
            .read(b"abc")
            .write(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let stats = EchoStats::default();

        let err = handle_connection(stream, &stats, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(stats.snapshot().bytes_echoed, 3);
    }

    #[tokio::test]
    async fn test_connection_limit_holds_extra_clients() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let (server, addr, _stop_tx, _task) = spawn_server(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_echo(&mut first, b"one").await;

        // Connects through the backlog but is not served while `first` holds the slot
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let mut reply = [0u8; 3];
        let waited =
            tokio::time::timeout(Duration::from_millis(200), second.read_exact(&mut reply)).await;
        assert!(waited.is_err());
        let stats = server.stats().snapshot();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.accepted, 1);

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"two");
        assert_eq!(server.stats().snapshot().accepted, 2);
    }

    #[tokio::test]
    async fn test_reset_connection_does_not_stop_accepting() {
        let (server, addr, _stop_tx, task) = spawn_server(test_config()).await;

        let mut doomed = TcpStream::connect(addr).await.unwrap();
        assert_echo(&mut doomed, b"first").await;
        doomed.write_all(b"abandoned").await.unwrap();
        // Zero linger turns the close into a reset
        socket2::SockRef::from(&doomed)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(doomed);

        let mut later = TcpStream::connect(addr).await.unwrap();
        assert_echo(&mut later, b"still serving").await;

        assert!(!task.is_finished());
        assert_eq!(server.stats().snapshot().accepted, 2);
    }

    #[tokio::test]
    async fn test_shutdown_returns_with_connection_open() {
        let (_server, addr, stop_tx, task) = spawn_server(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_echo(&mut client, b"before").await;

        let _ = stop_tx.send(());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The connection task outlives the accept loop
        assert_echo(&mut client, b"after").await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let config = ServerConfig {
            listen: "nonsense".to_string(),
            ..test_config()
        };
        let server = Server::new(config);
        let err = server.bind().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
