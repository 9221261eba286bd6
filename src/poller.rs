// Poll orchestrator: one cycle = every enabled device polled concurrently (bounded),
// counters decoded, reconciled against the per-device shard and emitted as samples.
// Device failures stay local to the device; cycles never overlap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, instrument};

use crate::config::PollerConfig;
use crate::counter::{CounterStore, Observation, Reading, Reconciler, RolloverPolicy, decode_counter};
use crate::error::{DecodeError, PollError, TransportError};
use crate::models::{CounterKey, Credentials, Device, Direction, OperStatus, RawValue, Sample};
use crate::transport::SnmpTransport;
use crate::vendor::{
    CounterOid, CounterWidth, Resolution, SYS_DESCR, VendorProfile, VendorResolver, instance_oid,
};
use crate::worker::{Cycle, CycleReport};

/// Runtime knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub max_concurrent_device_polls: usize,
    pub query_timeout: Duration,
    pub max_oids_per_request: usize,
    pub policy: RolloverPolicy,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

impl From<&PollerConfig> for PollerSettings {
    fn from(cfg: &PollerConfig) -> Self {
        Self {
            max_concurrent_device_polls: cfg.max_concurrent_device_polls.max(1),
            query_timeout: cfg.query_timeout(),
            max_oids_per_request: cfg.max_oids_per_request.max(1),
            policy: cfg.rollover_policy(),
        }
    }
}

/// Running totals since start.
#[derive(Debug, Default)]
pub struct PollStats {
    cycles_run: AtomicU64,
    cycles_skipped: AtomicU64,
    samples_emitted: AtomicU64,
    device_failures: AtomicU64,
    counter_failures: AtomicU64,
    fallbacks_32bit: AtomicU64,
    counter_resets: AtomicU64,
    wraps_reconstructed: AtomicU64,
    timeout_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatsSnapshot {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub samples_emitted: u64,
    pub device_failures: u64,
    pub counter_failures: u64,
    pub fallbacks_32bit: u64,
    pub counter_resets: u64,
    pub wraps_reconstructed: u64,
    pub timeout_retries: u64,
}

impl PollStats {
    pub fn snapshot(&self) -> PollStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PollStatsSnapshot {
            cycles_run: get(&self.cycles_run),
            cycles_skipped: get(&self.cycles_skipped),
            samples_emitted: get(&self.samples_emitted),
            device_failures: get(&self.device_failures),
            counter_failures: get(&self.counter_failures),
            fallbacks_32bit: get(&self.fallbacks_32bit),
            counter_resets: get(&self.counter_resets),
            wraps_reconstructed: get(&self.wraps_reconstructed),
            timeout_retries: get(&self.timeout_retries),
        }
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// What a device contributed to a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceOutcome {
    pub samples: usize,
    pub baselines: usize,
    pub counter_failures: usize,
}

/// Position of a requested OID in a device batch.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Counter {
        counter: usize,
        level: usize,
    },
    OperStatus {
        iface: usize,
    },
    Name {
        iface: usize,
    },
}

struct Answer {
    value: RawValue,
    at: Instant,
    timestamp: DateTime<Utc>,
}

/// Columns of one counter read so far this cycle.
struct PendingCounter {
    iface: usize,
    direction: Direction,
    /// Decoded values in profile order, with the instant of the first one.
    values: Vec<(CounterWidth, u64)>,
    at: Option<(Instant, DateTime<Utc>)>,
    /// Lowest profile level not asked for yet.
    next_level: usize,
    preferred_failed: bool,
    last_error: Option<DecodeError>,
}

impl PendingCounter {
    fn accept(&mut self, column: CounterOid, answer: &Answer) -> Result<(), DecodeError> {
        let value = decode_counter(&answer.value, column.width)?;
        self.values.push((column.width, value));
        self.at.get_or_insert((answer.at, answer.timestamp));
        Ok(())
    }

    fn reading(&self) -> Option<Reading> {
        let (width, value) = *self.values.first()?;
        let (at, timestamp) = self.at?;
        Some(Reading {
            value,
            width,
            alternate: self.values.get(1).copied(),
            at,
            timestamp,
        })
    }
}

struct PollerInner {
    transport: Arc<dyn SnmpTransport>,
    devices: RwLock<Arc<Vec<Arc<Device>>>>,
    resolver: VendorResolver,
    store: CounterStore,
    reconciler: Reconciler,
    settings: PollerSettings,
    limiter: Arc<Semaphore>,
    cycle_guard: tokio::sync::Mutex<()>,
    cycle_count: AtomicU64,
    interface_names: RwLock<HashMap<(String, u32), String>>,
    sample_tx: mpsc::Sender<Sample>,
    stats: PollStats,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(
        transport: Arc<dyn SnmpTransport>,
        devices: Vec<Device>,
        settings: PollerSettings,
        sample_tx: mpsc::Sender<Sample>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.max_concurrent_device_polls.max(1)));
        Self {
            inner: Arc::new(PollerInner {
                transport,
                devices: RwLock::new(Arc::new(devices.into_iter().map(Arc::new).collect())),
                resolver: VendorResolver::new(),
                store: CounterStore::new(),
                reconciler: Reconciler::new(settings.policy),
                limiter,
                cycle_guard: tokio::sync::Mutex::new(()),
                cycle_count: AtomicU64::new(0),
                interface_names: RwLock::new(HashMap::new()),
                sample_tx,
                stats: PollStats::default(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> PollStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn store(&self) -> &CounterStore {
        &self.inner.store
    }

    pub fn resolver(&self) -> &VendorResolver {
        &self.inner.resolver
    }

    pub fn devices(&self) -> Arc<Vec<Arc<Device>>> {
        self.inner.current_devices()
    }

    /// Runs one cycle unless another is still in progress, in which case the request is
    /// skipped and counted.
    pub async fn poll_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let Ok(_running) = inner.cycle_guard.try_lock() else {
            bump(&inner.stats.cycles_skipped, 1);
            tracing::warn!("previous poll cycle still running; skipping this one");
            return CycleReport::skipped();
        };

        let cycle = inner.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let devices: Vec<Arc<Device>> = inner
            .current_devices()
            .iter()
            .filter(|d| d.enabled)
            .cloned()
            .collect();

        let mut tasks = JoinSet::new();
        for device in &devices {
            let inner = self.inner.clone();
            let device = device.clone();
            let span = tracing::debug_span!("poll_device", device = %device.id, cycle);
            tasks.spawn(
                async move {
                    let outcome = match inner.limiter.clone().acquire_owned().await {
                        Ok(_permit) => inner.poll_device(&device).await,
                        Err(_) => Err(PollError::Transport(TransportError::Unreachable {
                            host: device.host.clone(),
                            reason: "poller shut down".into(),
                        })),
                    };
                    (device.id.clone(), outcome)
                }
                .instrument(span),
            );
        }

        let mut report = CycleReport {
            cycle,
            devices_polled: devices.len(),
            ..CycleReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.samples += outcome.samples;
                    report.counter_failures += outcome.counter_failures;
                }
                Ok((device_id, Err(e))) => {
                    bump(&inner.stats.device_failures, 1);
                    tracing::warn!(
                        device = %device_id,
                        error = %e,
                        operation = "poll_device",
                        "device poll failed; skipped this cycle"
                    );
                    report.failures.push((device_id, e.to_string()));
                }
                Err(e) => {
                    bump(&inner.stats.device_failures, 1);
                    tracing::error!(error = %e, "device poll task aborted");
                    report.failures.push(("<task>".into(), e.to_string()));
                }
            }
        }

        report.duration = started.elapsed();
        bump(&inner.stats.cycles_run, 1);
        tracing::info!(
            cycle,
            devices = report.devices_polled,
            failed = report.failures.len(),
            samples = report.samples,
            duration_ms = report.duration.as_millis() as u64,
            "poll cycle complete"
        );
        report
    }

    /// Replaces the device set. Vendor resolutions of changed devices are dropped, and
    /// counter state of removed/disabled devices and deselected interfaces is discarded.
    pub async fn update_devices(&self, devices: Vec<Device>) {
        let inner = &self.inner;
        let devices: Vec<Arc<Device>> = devices.into_iter().map(Arc::new).collect();
        // Swap first: a cycle still reconciling a removed device sees it gone and does
        // not bring its shard back after the pruning below.
        let previous = match inner.devices.write() {
            Ok(mut current) => std::mem::replace(&mut *current, Arc::new(devices.clone())),
            Err(_) => inner.current_devices(),
        };
        let next: HashMap<&str, &Device> = devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| (d.id.as_str(), d.as_ref()))
            .collect();

        for old in previous.iter() {
            match next.get(old.id.as_str()) {
                None => {
                    inner.store.remove_device(&old.id);
                    inner.resolver.invalidate(&old.id);
                    tracing::info!(device = %old.id, "device removed or disabled; state dropped");
                }
                Some(new) => {
                    if new.resolution_fingerprint() != old.resolution_fingerprint() {
                        inner.resolver.invalidate(&old.id);
                    }
                    if let Some(shard) = inner.store.existing(&old.id) {
                        shard
                            .lock()
                            .await
                            .retain(|key| new.interface(key.if_index).is_some());
                    }
                }
            }
        }
        inner
            .store
            .retain_devices(|id| next.contains_key(id));
        inner.resolver.retain(|id| next.contains_key(id));
        if let Ok(mut names) = inner.interface_names.write() {
            names.retain(|(device_id, index), _| {
                next.get(device_id.as_str())
                    .is_some_and(|d| d.interface(*index).is_some())
            });
        }

        tracing::info!(devices = devices.len(), "device set updated");
    }
}

#[async_trait]
impl Cycle for Poller {
    fn name(&self) -> &'static str {
        "snmp-poller"
    }

    async fn run_cycle(&self) -> CycleReport {
        self.poll_cycle().await
    }

    fn log_stats(&self) {
        let s = self.stats();
        tracing::info!(
            cycles_run = s.cycles_run,
            cycles_skipped = s.cycles_skipped,
            samples_emitted = s.samples_emitted,
            device_failures = s.device_failures,
            counter_failures = s.counter_failures,
            fallbacks_32bit = s.fallbacks_32bit,
            counter_resets = s.counter_resets,
            wraps_reconstructed = s.wraps_reconstructed,
            timeout_retries = s.timeout_retries,
            "poller stats"
        );
    }
}

impl PollerInner {
    fn current_devices(&self) -> Arc<Vec<Arc<Device>>> {
        self.devices
            .read()
            .map(|d| d.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn poll_device(&self, device: &Device) -> Result<DeviceOutcome, PollError> {
        let resolution = self.resolve_vendor(device).await?;
        let profile = resolution.kind.profile();
        let paired = self.counters_to_pair(device, profile).await;

        // Primary batch: the first usable counter column per interface and direction
        // (plus the next one for counters that fell back last cycle), oper status, and
        // the description of interfaces that still need a name.
        let mut slots = Vec::new();
        let mut oids = Vec::new();
        let mut pending: Vec<PendingCounter> = Vec::new();
        for (i, iface) in device.interfaces.iter().enumerate() {
            for direction in Direction::BOTH {
                let columns = profile.counters(direction);
                let Some(first) = first_column(columns, &device.credentials) else {
                    continue;
                };
                let pair = paired.contains(&(iface.index, direction)) && first + 1 < columns.len();
                let last = if pair { first + 1 } else { first };
                for level in first..=last {
                    slots.push(Slot::Counter {
                        counter: pending.len(),
                        level,
                    });
                    oids.push(instance_oid(columns[level].oid, iface.index));
                }
                pending.push(PendingCounter {
                    iface: i,
                    direction,
                    values: Vec::new(),
                    at: None,
                    next_level: last + 1,
                    preferred_failed: false,
                    last_error: None,
                });
            }
            slots.push(Slot::OperStatus { iface: i });
            oids.push(instance_oid(profile.oids.if_oper_status, iface.index));
            if iface.name.is_empty() && self.cached_name(&device.id, iface.index).is_none() {
                slots.push(Slot::Name { iface: i });
                oids.push(instance_oid(profile.oids.if_descr, iface.index));
            }
        }

        let answers = self.query_batched(device, &oids).await?;

        let mut oper: HashMap<usize, OperStatus> = HashMap::new();
        let mut outcome = DeviceOutcome::default();

        for (slot, answer) in slots.iter().zip(answers) {
            match *slot {
                Slot::Counter { counter, level } => {
                    let entry = &mut pending[counter];
                    let column = profile.counters(entry.direction)[level];
                    if let Err(e) = entry.accept(column, &answer) {
                        if entry.values.is_empty() {
                            entry.preferred_failed = true;
                        }
                        entry.last_error = Some(e);
                    }
                }
                Slot::OperStatus { iface } => {
                    if let Some(status) = answer.value.as_i64().and_then(OperStatus::from_code) {
                        oper.insert(iface, status);
                    }
                }
                Slot::Name { iface } => {
                    if let Some(name) = answer.value.as_text().filter(|n| !n.is_empty()) {
                        self.cache_name(&device.id, device.interfaces[iface].index, name);
                    }
                }
            }
        }

        // Same-cycle fallback for counters whose columns so far all failed.
        let mut fallbacks: Vec<(usize, usize)> = Vec::new();
        for (n, entry) in pending.iter().enumerate() {
            if entry.preferred_failed {
                bump(&self.stats.fallbacks_32bit, 1);
            }
            if entry.values.is_empty() && entry.next_level < profile.counters(entry.direction).len() {
                tracing::debug!(
                    device = %device.id,
                    if_index = device.interfaces[entry.iface].index,
                    direction = %entry.direction,
                    error = ?entry.last_error,
                    "preferred counter unusable; falling back to 32-bit this cycle"
                );
                fallbacks.push((n, entry.next_level));
            }
        }

        if !fallbacks.is_empty() {
            let fallback_oids: Vec<String> = fallbacks
                .iter()
                .map(|&(n, level)| {
                    let entry = &pending[n];
                    instance_oid(
                        profile.counters(entry.direction)[level].oid,
                        device.interfaces[entry.iface].index,
                    )
                })
                .collect();
            match self.query_batched(device, &fallback_oids).await {
                Ok(answers) => {
                    for (&(n, level), answer) in fallbacks.iter().zip(answers) {
                        let entry = &mut pending[n];
                        let column = profile.counters(entry.direction)[level];
                        if let Err(e) = entry.accept(column, &answer) {
                            entry.last_error = Some(e);
                        }
                    }
                }
                Err(e) if pending.iter().all(|p| p.values.is_empty()) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        device = %device.id,
                        error = %e,
                        operation = "fallback_query",
                        "32-bit fallback query failed"
                    );
                    for &(n, _) in &fallbacks {
                        pending[n].last_error = None;
                    }
                    bump(&self.stats.counter_failures, fallbacks.len() as u64);
                    outcome.counter_failures += fallbacks.len();
                }
            }
        }

        let mut readings: Vec<(usize, Direction, Reading)> = Vec::new();
        let mut last_decode_error: Option<DecodeError> = None;
        for entry in &mut pending {
            match entry.reading() {
                Some(reading) => readings.push((entry.iface, entry.direction, reading)),
                None => {
                    if let Some(e) = entry.last_error.take() {
                        self.counter_failed(device, entry.iface, entry.direction, &e, &mut outcome);
                        last_decode_error = Some(e);
                    }
                }
            }
        }

        if readings.is_empty()
            && let Some(e) = last_decode_error
        {
            return Err(e.into());
        }

        let samples = self
            .reconcile(device, profile, resolution, readings, &oper, &mut outcome)
            .await;
        for sample in samples {
            if self.sample_tx.send(sample).await.is_err() {
                tracing::debug!(device = %device.id, "sample channel closed");
                break;
            }
            bump(&self.stats.samples_emitted, 1);
            outcome.samples += 1;
        }
        Ok(outcome)
    }

    /// Counters whose stored reading lacks the preferred column, i.e. the last cycle fell
    /// back. Their next column is read alongside the preferred one so a sample can be
    /// taken on whichever column has a value at both ends of the interval.
    async fn counters_to_pair(
        &self,
        device: &Device,
        profile: &VendorProfile,
    ) -> HashSet<(u32, Direction)> {
        let mut paired = HashSet::new();
        let Some(shard) = self.store.existing(&device.id) else {
            return paired;
        };
        let shard = shard.lock().await;
        for iface in &device.interfaces {
            for direction in Direction::BOTH {
                let columns = profile.counters(direction);
                let Some(first) = first_column(columns, &device.credentials) else {
                    continue;
                };
                let key = CounterKey::new(device.id.clone(), iface.index, direction);
                if let Some(state) = shard.get(&key)
                    && state.value(columns[first].width).is_none()
                {
                    paired.insert((iface.index, direction));
                }
            }
        }
        paired
    }

    fn is_configured(&self, device_id: &str) -> bool {
        self.current_devices()
            .iter()
            .any(|d| d.id == device_id && d.enabled)
    }

    /// Applies readings to the device's shard. The shard lock is held for the whole
    /// batch and released before samples are sent. Readings of a device removed while
    /// it was being polled are dropped along with its shard.
    async fn reconcile(
        &self,
        device: &Device,
        profile: &VendorProfile,
        resolution: Resolution,
        readings: Vec<(usize, Direction, Reading)>,
        oper: &HashMap<usize, OperStatus>,
        outcome: &mut DeviceOutcome,
    ) -> Vec<Sample> {
        let shard = self.store.shard(&device.id);
        let mut shard = shard.lock().await;
        if !self.is_configured(&device.id) {
            drop(shard);
            self.store.remove_device(&device.id);
            tracing::debug!(device = %device.id, "device removed during the cycle; readings dropped");
            return Vec::new();
        }
        let mut samples = Vec::with_capacity(readings.len());

        for (iface, direction, reading) in readings {
            let target = &device.interfaces[iface];
            let key = CounterKey::new(device.id.clone(), target.index, direction);
            match self.reconciler.observe(&mut shard, &key, reading) {
                Observation::Delta(r) => {
                    if r.reset {
                        bump(&self.stats.counter_resets, 1);
                    }
                    bump(&self.stats.wraps_reconstructed, r.wraps as u64);
                    samples.push(Sample {
                        device_id: device.id.clone(),
                        interface_index: target.index,
                        interface_name: self.interface_name(device, iface),
                        direction,
                        vendor: profile.kind,
                        delta_octets: r.delta_octets,
                        interval_seconds: r.interval_seconds,
                        timestamp: r.timestamp,
                        counter_bits: r.width.bits(),
                        wraps: r.wraps,
                        reset: r.reset,
                        oper_status: oper.get(&iface).copied(),
                    });
                }
                Observation::Baseline | Observation::Rebased { .. } => outcome.baselines += 1,
                Observation::Ignored => {}
            }
        }
        tracing::trace!(
            device = %device.id,
            vendor = %resolution.kind,
            samples = samples.len(),
            "device reconciled"
        );
        samples
    }

    #[instrument(skip(self, device), fields(device = %device.id, operation = "resolve_vendor"))]
    async fn resolve_vendor(&self, device: &Device) -> Result<Resolution, TransportError> {
        if let Some(resolution) = self.resolver.lookup(device) {
            return Ok(resolution);
        }
        let values = self.query_with_retry(device, &[SYS_DESCR.to_string()]).await?;
        let descr = values
            .first()
            .and_then(RawValue::as_text)
            .unwrap_or_default();
        Ok(self.resolver.record_sys_descr(device, &descr))
    }

    /// Splits `oids` into request-sized chunks; any failed chunk fails the batch.
    async fn query_batched(
        &self,
        device: &Device,
        oids: &[String],
    ) -> Result<Vec<Answer>, TransportError> {
        let mut answers = Vec::with_capacity(oids.len());
        for chunk in oids.chunks(self.settings.max_oids_per_request) {
            let values = self.query_with_retry(device, chunk).await?;
            let at = Instant::now();
            let timestamp = Utc::now();
            answers.extend(values.into_iter().map(|value| Answer {
                value,
                at,
                timestamp,
            }));
        }
        Ok(answers)
    }

    /// One exchange bounded by the query timeout, with a single retry on timeout only.
    async fn query_with_retry(
        &self,
        device: &Device,
        oids: &[String],
    ) -> Result<Vec<RawValue>, TransportError> {
        let timeout = self.settings.query_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(timeout, self.transport.get_many(device, oids)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout {
                        host: device.host.clone(),
                        after: timeout,
                    }),
                };
            match result {
                Ok(values) if values.len() == oids.len() => return Ok(values),
                Ok(values) => {
                    return Err(TransportError::Malformed {
                        host: device.host.clone(),
                        reason: format!("asked for {} values, got {}", oids.len(), values.len()),
                    });
                }
                Err(e) if e.is_timeout() && attempt == 1 => {
                    bump(&self.stats.timeout_retries, 1);
                    tracing::debug!(device = %device.id, error = %e, "query timed out; retrying once");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn counter_failed(
        &self,
        device: &Device,
        iface: usize,
        direction: Direction,
        error: &DecodeError,
        outcome: &mut DeviceOutcome,
    ) {
        bump(&self.stats.counter_failures, 1);
        outcome.counter_failures += 1;
        tracing::warn!(
            device = %device.id,
            if_index = device.interfaces[iface].index,
            %direction,
            error = %error,
            "counter could not be decoded; skipped this cycle"
        );
    }

    fn interface_name(&self, device: &Device, iface: usize) -> String {
        let target = &device.interfaces[iface];
        if !target.name.is_empty() {
            return target.name.clone();
        }
        self.cached_name(&device.id, target.index)
            .unwrap_or_else(|| format!("if{}", target.index))
    }

    fn cached_name(&self, device_id: &str, index: u32) -> Option<String> {
        self.interface_names
            .read()
            .ok()?
            .get(&(device_id.to_string(), index))
            .cloned()
    }

    fn cache_name(&self, device_id: &str, index: u32, name: String) {
        if let Ok(mut names) = self.interface_names.write() {
            names.insert((device_id.to_string(), index), name);
        }
    }
}

/// Profile level a device's session can start from. SNMPv1 cannot carry Counter64, so
/// v1 devices start at the first 32-bit column.
fn first_column(columns: &[CounterOid], credentials: &Credentials) -> Option<usize> {
    match credentials {
        Credentials::V1 { .. } => columns.iter().position(|c| c.width == CounterWidth::Bits32),
        _ => (!columns.is_empty()).then_some(0),
    }
}
