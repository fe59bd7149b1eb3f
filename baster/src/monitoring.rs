//! Request telemetry
//!
//! The dispatcher records one [`Measurement`] per completed request. Each
//! registered [`Sink`] owns a bounded queue drained on its own interval, so a
//! slow or failing sink never blocks requests nor the other sinks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};

/// Default queue capacity per sink
pub const DEFAULT_BACKLOG: usize = 1000;

/// Default flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// One completed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Domain name, or the path's monitoring name
    pub domain: String,
    pub method: String,
    pub status: u16,
    pub time: DateTime<Utc>,
    pub latency_ms: u64,
    pub url: String,
    pub tags: BTreeMap<String, String>,
    pub referer: String,
}

/// Anything that accepts measurements
pub trait Monitor: Send + Sync {
    /// Enqueue a measurement. Never blocks on I/O.
    fn record(&self, measurement: Measurement);
}

/// Telemetry destination
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn flush(&self, batch: &[Measurement]) -> Result<()>;
}

struct SinkQueue {
    sink: Arc<dyn Sink>,
    pending: Mutex<VecDeque<Measurement>>,
    capacity: usize,
}

impl SinkQueue {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Measurement>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, measurement: Measurement) {
        let mut pending = self.pending();
        pending.push_back(measurement);
        if pending.len() > self.capacity {
            let excess = pending.len() - self.capacity;
            pending.drain(..excess);
            warn!(sink = self.sink.name(), discarded = excess, "Discarding old measurements");
        }
    }

    /// Put back a batch that failed to flush, ahead of newer entries
    fn restore(&self, batch: Vec<Measurement>) {
        let mut pending = self.pending();
        for measurement in batch.into_iter().rev() {
            pending.push_front(measurement);
        }
        if pending.len() > self.capacity {
            let excess = pending.len() - self.capacity;
            pending.drain(..excess);
            warn!(sink = self.sink.name(), discarded = excess, "Discarding old measurements");
        }
    }

    async fn flush(&self) {
        let batch: Vec<Measurement> = self.pending().drain(..).collect();
        if batch.is_empty() {
            return;
        }
        match self.sink.flush(&batch).await {
            Ok(()) => debug!(sink = self.sink.name(), count = batch.len(), "Measurements flushed"),
            Err(e) => {
                error!(sink = self.sink.name(), count = batch.len(), error = %e, "Cannot write measurements");
                self.restore(batch);
            }
        }
    }
}

/// Fan-out of measurements to every sink
pub struct Monitoring {
    queues: Vec<Arc<SinkQueue>>,
    flush_interval: Duration,
}

impl Monitoring {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            queues: Vec::new(),
            flush_interval,
        }
    }

    /// Monitoring without sinks
    pub fn disabled() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>, capacity: usize) -> Self {
        info!(sink = sink.name(), capacity, "Monitoring sink registered");
        self.queues.push(Arc::new(SinkQueue {
            sink,
            pending: Mutex::new(VecDeque::new()),
            capacity,
        }));
        self
    }

    /// Spawn one flush loop per sink
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.queues
            .iter()
            .map(|queue| {
                let queue = queue.clone();
                let period = self.flush_interval;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        queue.flush().await;
                    }
                })
            })
            .collect()
    }

    /// Flush every sink now
    pub async fn flush(&self) {
        for queue in &self.queues {
            queue.flush().await;
        }
    }
}

impl Monitor for Monitoring {
    fn record(&self, measurement: Measurement) {
        for queue in &self.queues {
            queue.push(measurement.clone());
        }
    }
}

/// Writes measurements to the log
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn flush(&self, batch: &[Measurement]) -> Result<()> {
        for m in batch {
            info!(
                domain = %m.domain,
                method = %m.method,
                status = m.status,
                latency_ms = m.latency_ms,
                url = %m.url,
                referer = %m.referer,
                tags = ?m.tags,
                "measurement"
            );
        }
        Ok(())
    }
}

/// POSTs batches as a JSON array
pub struct HttpSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProxyError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn flush(&self, batch: &[Measurement]) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| ProxyError::External {
                service: "monitoring",
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ProxyError::External {
                service: "monitoring",
                message: format!("unexpected status {}", response.status()),
            });
        }
        Ok(())
    }
}
