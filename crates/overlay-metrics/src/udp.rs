//! Statsd-style UDP metrics emitter.
//!
//! `UdpSink` encodes each metric into a line and pushes it onto a bounded
//! queue; `UdpEmitter` drains the queue from a background task and packs
//! lines into datagrams.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::MetricsSink;

/// Maximum payload of a single datagram.
const MAX_DATAGRAM: usize = 512;

/// Lines buffered between the sink and the emitter before dropping.
const QUEUE_CAPACITY: usize = 1024;

/// Errors raised while setting up the UDP emitter.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("binding metrics socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("connecting metrics socket to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cheap, cloneable handle that reports metrics to a [`UdpEmitter`].
#[derive(Debug, Clone)]
pub struct UdpSink {
    prefix: Arc<str>,
    tx: mpsc::Sender<String>,
}

/// Background half of the UDP sink. Owns the socket.
pub struct UdpEmitter {
    socket: UdpSocket,
    rx: mpsc::Receiver<String>,
    flush_interval: Duration,
}

impl UdpSink {
    /// Create a sink/emitter pair sending to `addr`.
    ///
    /// Every metric name is prefixed with `prefix` verbatim.
    pub async fn connect(
        addr: &str,
        prefix: &str,
        flush_interval: Duration,
    ) -> Result<(UdpSink, UdpEmitter), MetricsError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(MetricsError::Bind)?;
        socket
            .connect(addr)
            .await
            .map_err(|source| MetricsError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        info!(%addr, "metrics emitter connected");

        Ok((
            UdpSink {
                prefix: Arc::from(prefix),
                tx,
            },
            UdpEmitter {
                socket,
                rx,
                flush_interval,
            },
        ))
    }

    fn enqueue(&self, line: String) {
        if let Err(e) = self.tx.try_send(line) {
            debug!(error = %e, "dropping metric");
        }
    }
}

impl MetricsSink for UdpSink {
    fn send_duration(&self, name: &str, duration: Duration) {
        self.enqueue(encode_duration(&self.prefix, name, duration));
    }

    fn increment_counter(&self, name: &str) {
        self.enqueue(encode_counter(&self.prefix, name));
    }
}

impl UdpEmitter {
    /// Drain the queue until shutdown or until every sink handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut batch = String::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                line = self.rx.recv() => match line {
                    Some(line) => self.push(&mut batch, line).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush(&mut batch).await,
                _ = shutdown.changed() => {
                    while let Ok(line) = self.rx.try_recv() {
                        self.push(&mut batch, line).await;
                    }
                    break;
                }
            }
        }

        self.flush(&mut batch).await;
        debug!("metrics emitter stopped");
    }

    async fn push(&self, batch: &mut String, line: String) {
        if !batch.is_empty() && batch.len() + 1 + line.len() > MAX_DATAGRAM {
            self.flush(batch).await;
        }
        if !batch.is_empty() {
            batch.push('\n');
        }
        batch.push_str(&line);
    }

    async fn flush(&self, batch: &mut String) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.socket.send(batch.as_bytes()).await {
            debug!(error = %e, bytes = batch.len(), "metrics datagram dropped");
        }
        batch.clear();
    }
}

fn encode_duration(prefix: &str, name: &str, duration: Duration) -> String {
    format!("{prefix}{name}:{:.3}|ms", duration.as_secs_f64() * 1000.0)
}

fn encode_counter(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}:1|c")
}
