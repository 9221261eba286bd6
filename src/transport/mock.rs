// Scripted transport for tests. Values are programmed per device id and OID; OIDs with
// no programmed value answer `NoSuchInstance`. Failures are queued per exchange, permanent
// per device or tied to one OID. A per-device delay simulates slow agents under paused time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::SnmpTransport;
use crate::error::TransportError;
use crate::models::{Device, RawValue};

/// One exchange seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub device_id: String,
    pub oids: Vec<String>,
}

#[derive(Default)]
struct MockTransportInner {
    values: HashMap<(String, String), RawValue>,
    queued_failures: HashMap<String, VecDeque<TransportError>>,
    permanent_failures: HashMap<String, TransportError>,
    oid_failures: HashMap<(String, String), TransportError>,
    delays: HashMap<String, Duration>,
    requests: Vec<RecordedRequest>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Programs the value returned for `oid` on `device_id`.
    pub fn set(&self, device_id: &str, oid: &str, value: RawValue) {
        self.lock()
            .values
            .insert((device_id.to_string(), oid.to_string()), value);
    }

    pub fn unset(&self, device_id: &str, oid: &str) {
        self.lock()
            .values
            .remove(&(device_id.to_string(), oid.to_string()));
    }

    /// Fails the next exchange with `device_id`.
    pub fn fail_next(&self, device_id: &str, error: TransportError) {
        self.lock()
            .queued_failures
            .entry(device_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fails every exchange with `device_id` until `clear_failure`.
    pub fn fail_always(&self, device_id: &str, error: TransportError) {
        self.lock()
            .permanent_failures
            .insert(device_id.to_string(), error);
    }

    /// Fails every exchange with `device_id` whose request includes `oid`, the way an
    /// SNMPv1 agent rejects a whole PDU over one unknown name.
    pub fn fail_oid(&self, device_id: &str, oid: &str, error: TransportError) {
        self.lock()
            .oid_failures
            .insert((device_id.to_string(), oid.to_string()), error);
    }

    pub fn clear_failure(&self, device_id: &str) {
        let mut inner = self.lock();
        inner.permanent_failures.remove(device_id);
        inner.queued_failures.remove(device_id);
        inner.oid_failures.retain(|(id, _), _| id != device_id);
    }

    /// Delays every exchange with `device_id`.
    pub fn set_delay(&self, device_id: &str, delay: Duration) {
        self.lock().delays.insert(device_id.to_string(), delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Number of exchanges that asked for `oid` on `device_id`.
    pub fn request_count(&self, device_id: &str, oid: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.device_id == device_id && r.oids.iter().any(|o| o == oid))
            .count()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }
}

#[async_trait]
impl SnmpTransport for MockTransport {
    async fn get(&self, device: &Device, oid: &str) -> Result<RawValue, TransportError> {
        let mut values = self.get_many(device, &[oid.to_string()]).await?;
        values.pop().ok_or_else(|| TransportError::Malformed {
            host: device.host.clone(),
            reason: "empty response".into(),
        })
    }

    async fn get_many(
        &self,
        device: &Device,
        oids: &[String],
    ) -> Result<Vec<RawValue>, TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.requests.push(RecordedRequest {
                device_id: device.id.clone(),
                oids: oids.to_vec(),
            });
            inner.delays.get(&device.id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if let Some(error) = inner
            .queued_failures
            .get_mut(&device.id)
            .and_then(|q| q.pop_front())
        {
            return Err(error);
        }
        if let Some(error) = inner.permanent_failures.get(&device.id) {
            return Err(error.clone());
        }
        if let Some(error) = oids
            .iter()
            .find_map(|oid| inner.oid_failures.get(&(device.id.clone(), oid.clone())))
        {
            return Err(error.clone());
        }
        Ok(oids
            .iter()
            .map(|oid| {
                inner
                    .values
                    .get(&(device.id.clone(), oid.clone()))
                    .cloned()
                    .unwrap_or(RawValue::NoSuchInstance)
            })
            .collect())
    }
}
