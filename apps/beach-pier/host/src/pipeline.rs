//! Bounded channel between a session's terminal reader and whichever
//! connection is currently streaming it.
//!
//! The producer runs on a dedicated OS thread and blocks while the channel is
//! full; nothing is ever dropped. Dropping the sender is how the consumer
//! learns that the terminal has gone away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("output pipeline closed")]
pub struct PipelineClosed;

#[derive(Debug, Default)]
pub struct PipelineStats {
    chunks: AtomicU64,
    bytes: AtomicU64,
    stalls: AtomicU64,
    stalled_nanos: AtomicU64,
}

impl PipelineStats {
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of sends that found the channel full and had to wait.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn stalled_time(&self) -> Duration {
        Duration::from_nanos(self.stalled_nanos.load(Ordering::Relaxed))
    }

    fn record(&self, len: usize, stalled: Option<Duration>) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        if let Some(waited) = stalled {
            self.stalls.fetch_add(1, Ordering::Relaxed);
            self.stalled_nanos
                .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
            counter!("beach_pier_pipeline_stalls_total", 1);
        }
    }
}

pub fn output_channel(capacity: usize) -> (OutputSender, OutputReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(PipelineStats::default());
    (
        OutputSender {
            tx,
            stats: stats.clone(),
        },
        OutputReceiver { rx, stats },
    )
}

#[derive(Debug)]
pub struct OutputSender {
    tx: mpsc::Sender<OutputChunk>,
    stats: Arc<PipelineStats>,
}

impl OutputSender {
    /// Blocking send for the terminal reader thread. Must not be called from
    /// inside the async runtime.
    pub fn send_blocking(&self, chunk: OutputChunk) -> Result<(), PipelineClosed> {
        let full = self.tx.capacity() == 0;
        let started = full.then(Instant::now);
        let len = chunk.data.len();
        self.tx.blocking_send(chunk).map_err(|_| PipelineClosed)?;
        self.stats
            .record(len, started.map(|at| at.elapsed()));
        Ok(())
    }

    pub async fn send(&self, chunk: OutputChunk) -> Result<(), PipelineClosed> {
        let full = self.tx.capacity() == 0;
        let started = full.then(Instant::now);
        let len = chunk.data.len();
        self.tx.send(chunk).await.map_err(|_| PipelineClosed)?;
        self.stats
            .record(len, started.map(|at| at.elapsed()));
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }
}

#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::Receiver<OutputChunk>,
    stats: Arc<PipelineStats>,
}

impl OutputReceiver {
    /// `None` once the producer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }
}
