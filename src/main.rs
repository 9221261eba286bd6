use anyhow::Result;
use ifcollector::*;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Samples may go to stdout; logs stay on stderr.
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(name = version::NAME, version = version::VERSION, "starting");

    let device_set = app_config.device_set();
    for rejected in &device_set.rejected {
        tracing::warn!(error = %rejected, "device rejected by configuration");
    }
    if device_set.devices.is_empty() {
        tracing::warn!("no valid devices configured; cycles will be empty");
    }
    tracing::info!(
        devices = device_set.devices.len(),
        rejected = device_set.rejected.len(),
        "devices loaded"
    );

    let settings = poller::PollerSettings::from(&app_config.poller);
    let transport = Arc::new(transport::AsyncSnmpTransport::new(
        settings.query_timeout,
        settings.max_oids_per_request,
        app_config.transport.port,
    ));

    let samples_written_total = Arc::new(AtomicU64::new(0));
    let capacity = worker::writer_channel_capacity(
        app_config.output.channel_capacity,
        app_config.output.flush_rate,
    );
    let (sample_tx, sample_rx) = tokio::sync::mpsc::channel(capacity);
    let output = worker::open_output(&app_config.output.path)
        .await
        .map_err(|e| anyhow::anyhow!("opening {}: {}", app_config.output.path, e))?;
    let writer_handle = worker::spawn_sample_writer(
        sample_rx,
        output,
        worker::SampleWriterConfig {
            flush_rate: app_config.output.flush_rate,
            flush_interval_secs: app_config.output.flush_interval_secs,
        },
        samples_written_total.clone(),
    );

    let poller = poller::Poller::new(transport, device_set.devices, settings, sample_tx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            cycle: Arc::new(poller),
            samples_written_total,
            shutdown_rx,
        },
        worker::WorkerConfig {
            polling_interval_ms: app_config.poller.polling_interval_ms,
            stats_log_interval_secs: app_config.poller.stats_log_interval_secs,
        },
    );

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(());
    // The worker owns the poller and with it the last sample sender; once it is gone the
    // writer drains its buffer and exits.
    let _ = worker_handle.await;
    let _ = writer_handle.await;

    Ok(())
}
