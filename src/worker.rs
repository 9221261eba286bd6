// Background polling worker and the dedicated sample writer task.
// The worker drives one cycle per tick; samples flow to the writer over a bounded channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use tracing::Instrument;

use crate::models::Sample;

/// Channel capacity between poller and writer (backpressure if the writer falls behind).
pub fn writer_channel_capacity(configured: usize, flush_rate: usize) -> usize {
    configured.max(flush_rate * 2).max(32)
}

/// Summary of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Requested while the previous cycle was still running; nothing was polled.
    pub skipped: bool,
    pub devices_polled: usize,
    pub samples: usize,
    pub counter_failures: usize,
    /// (device id, error) for each device that produced nothing this cycle.
    pub failures: Vec<(String, String)>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn devices_failed(&self) -> usize {
        self.failures.len()
    }
}

/// Unit of periodic work driven by the worker.
#[async_trait]
pub trait Cycle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> CycleReport;

    /// Called on the stats tick.
    fn log_stats(&self) {}
}

pub struct WorkerDeps {
    pub cycle: Arc<dyn Cycle>,
    pub samples_written_total: Arc<AtomicU64>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Worker timing and logging config.
pub struct WorkerConfig {
    pub polling_interval_ms: u64,
    /// How often to log app stats (real seconds).
    pub stats_log_interval_secs: u64,
}

/// Batching for the sample writer task.
pub struct SampleWriterConfig {
    pub flush_rate: usize,
    pub flush_interval_secs: u64,
}

/// JSON Lines sink: "-" is stdout, anything else a file opened for append.
pub async fn open_output(path: &str) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    if path == "-" {
        return Ok(Box::new(tokio::io::stdout()));
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Box::new(file))
}

/// Spawns the task that receives samples and writes them as JSON Lines.
/// Flushes when buffer len >= flush_rate, or every flush_interval_secs, or when the channel
/// closes. Once every sender is dropped, it flushes what is left and exits.
pub fn spawn_sample_writer<W>(
    mut sample_rx: mpsc::Receiver<Sample>,
    mut out: W,
    config: SampleWriterConfig,
    samples_written_total: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let flush_interval = Duration::from_secs(config.flush_interval_secs);
    tokio::spawn(async move {
        let mut buffer: Vec<Sample> = Vec::new();
        let mut flush_tick = interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = sample_rx.recv() => {
                    match result {
                        Some(sample) => {
                            buffer.push(sample);
                            if buffer.len() >= config.flush_rate
                                && let Err(e) = flush_buffer(&mut out, &mut buffer, &samples_written_total).await
                            {
                                tracing::warn!(error = %e, "sample writer: write failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = flush_buffer(&mut out, &mut buffer, &samples_written_total).await {
                        tracing::warn!(error = %e, "sample writer: write failed");
                    }
                }
            }
        }
        if let Err(e) = flush_buffer(&mut out, &mut buffer, &samples_written_total).await {
            tracing::warn!(error = %e, "sample writer: final flush failed");
        }
        tracing::debug!("Sample writer shutting down");
    })
}

/// Writes the buffer as one JSON object per line. The buffer is emptied even on failure.
async fn flush_buffer<W>(
    out: &mut W,
    buffer: &mut Vec<Sample>,
    samples_written_total: &AtomicU64,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if buffer.is_empty() {
        return Ok(());
    }
    let samples = std::mem::take(buffer);
    let mut lines = Vec::with_capacity(samples.len() * 256);
    for sample in &samples {
        serde_json::to_writer(&mut lines, sample)?;
        lines.push(b'\n');
    }
    out.write_all(&lines).await?;
    out.flush().await?;
    samples_written_total.fetch_add(samples.len() as u64, Ordering::Relaxed);
    tracing::debug!(
        operation = "write_samples",
        samples_count = samples.len(),
        "Samples written"
    );
    Ok(())
}

/// Spawns the polling loop. Cycles run inline in the loop, so a slow cycle delays the
/// next tick instead of overlapping it (missed ticks are skipped).
pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        cycle,
        samples_written_total,
        mut shutdown_rx,
    } = deps;
    let WorkerConfig {
        polling_interval_ms,
        stats_log_interval_secs,
    } = config;

    let stats_log_interval = Duration::from_secs(stats_log_interval_secs);

    let worker_span = tracing::debug_span!("worker", cycle = cycle.name(), polling_interval_ms);

    tokio::spawn(
        async move {
            let mut tick = interval(Duration::from_millis(polling_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stats_log_tick = interval(stats_log_interval);
            stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut cycles_with_failures: u64 = 0;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let report = cycle.run_cycle().await;
                        if report.skipped {
                            continue;
                        }
                        if report.devices_failed() > 0 {
                            cycles_with_failures += 1;
                            tracing::debug!(
                                cycle = report.cycle,
                                failed = report.devices_failed(),
                                "cycle finished with device failures"
                            );
                        }
                        if report.duration >= tick.period() {
                            tracing::warn!(
                                cycle = report.cycle,
                                duration_ms = report.duration.as_millis() as u64,
                                polling_interval_ms,
                                "poll cycle overran the polling interval"
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Worker shutting down");
                        break;
                    }
                    _ = stats_log_tick.tick() => {
                        cycle.log_stats();
                        tracing::info!(
                            samples_written_total = samples_written_total.load(Ordering::Relaxed),
                            cycles_with_failures,
                            "app stats"
                        );
                    }
                }
            }
        }
        .instrument(worker_span),
    )
}
