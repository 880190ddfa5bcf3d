//! Stress client.
//!
//! Opens a fresh connection per attempt, sends the payload, prints the
//! reply and sleeps. A refused connection is reported and retried on the
//! next attempt; any other I/O error ends the run.

use crate::config::ClientConfig;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Totals for one client run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientReport {
    pub attempts: u64,
    pub replies: u64,
    pub refused: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub struct StressClient {
    config: ClientConfig,
}

impl StressClient {
    pub fn new(config: ClientConfig) -> Self {
        StressClient { config }
    }

    /// Connect, send the payload once and read a single reply.
    pub async fn exchange(&self) -> io::Result<Bytes> {
        let connect = TcpStream::connect(&self.config.target);
        let mut stream = match tokio::time::timeout(self.config.connect_timeout(), connect).await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.config.target),
                ))
            }
        };

        stream.write_all(self.config.payload.as_bytes()).await?;

        // Nothing sent means nothing to echo
        let mut reply = BytesMut::with_capacity(self.config.read_size);
        if !self.config.payload.is_empty() {
            let mut limited = (&mut stream).take(self.config.read_size as u64);
            let read = limited.read_buf(&mut reply);
            match tokio::time::timeout(self.config.read_timeout(), read).await {
                Ok(read) => {
                    read?;
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reply from {} in time", self.config.target),
                    ))
                }
            }
        }

        stream.shutdown().await?;
        Ok(reply.freeze())
    }

    /// Run attempts until the duration elapses or the iteration limit is hit.
    pub async fn run(&self) -> io::Result<ClientReport> {
        let started = Instant::now();
        let run_for = self.config.run_for();
        let mut report = ClientReport::default();

        info!(
            server = %self.config.target,
            duration_secs = self.config.duration,
            interval_ms = self.config.interval_ms,
            iterations = ?self.config.iterations,
            "Starting stress client"
        );

        loop {
            if run_for.map_or(false, |limit| started.elapsed() >= limit) {
                break;
            }
            if self
                .config
                .iterations
                .map_or(false, |limit| report.attempts >= limit)
            {
                break;
            }

            report.attempts += 1;
            let attempt = match run_for {
                Some(limit) => {
                    let remaining = limit.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, self.exchange()).await {
                        Ok(attempt) => attempt,
                        Err(_) => {
                            debug!(attempt = report.attempts, "Duration elapsed during exchange");
                            break;
                        }
                    }
                }
                None => self.exchange().await,
            };

            match attempt {
                Ok(reply) => {
                    report.replies += 1;
                    report.bytes_sent += self.config.payload.len() as u64;
                    report.bytes_received += reply.len() as u64;
                    println!("Received response: {}", String::from_utf8_lossy(&reply));
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    report.refused += 1;
                    warn!(server = %self.config.target, "Connection refused. Retrying...");
                }
                Err(e) => {
                    warn!(server = %self.config.target, error = %e, "Exchange failed");
                    return Err(e);
                }
            }

            debug!(attempt = report.attempts, "Sleeping");
            tokio::time::sleep(self.config.interval()).await;
        }

        info!(
            attempts = report.attempts,
            replies = report.replies,
            refused = report.refused,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stress client finished"
        );
        Ok(report)
    }
}
