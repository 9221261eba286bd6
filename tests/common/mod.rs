// Shared test helpers
#![allow(dead_code)]

use std::time::Duration;

use chrono::{TimeZone, Utc};
use ifcollector::counter::{Reading, RolloverPolicy};
use ifcollector::models::*;
use ifcollector::poller::PollerSettings;
use ifcollector::transport::MockTransport;
use ifcollector::vendor::*;

pub fn device(id: &str, indexes: &[u32]) -> Device {
    device_with_vendor(id, VendorSelection::Explicit(VendorKind::Standard), indexes)
}

pub fn device_with_vendor(id: &str, vendor: VendorSelection, indexes: &[u32]) -> Device {
    Device {
        id: id.to_string(),
        host: format!("{}.lab", id),
        credentials: Credentials::default(),
        vendor,
        enabled: true,
        interfaces: indexes
            .iter()
            .map(|&index| InterfaceTarget {
                device_id: id.to_string(),
                index,
                name: format!("port{}", index),
            })
            .collect(),
    }
}

pub fn hc_in(index: u32) -> String {
    instance_oid(IF_HC_IN_OCTETS, index)
}

pub fn hc_out(index: u32) -> String {
    instance_oid(IF_HC_OUT_OCTETS, index)
}

pub fn legacy_in(index: u32) -> String {
    instance_oid(IF_IN_OCTETS, index)
}

pub fn legacy_out(index: u32) -> String {
    instance_oid(IF_OUT_OCTETS, index)
}

/// Programs both 64-bit octet counters of one interface.
pub fn set_hc(mock: &MockTransport, device_id: &str, index: u32, in_octets: u64, out_octets: u64) {
    mock.set(device_id, &hc_in(index), RawValue::Counter64(in_octets));
    mock.set(device_id, &hc_out(index), RawValue::Counter64(out_octets));
}

pub fn settings() -> PollerSettings {
    PollerSettings {
        max_concurrent_device_polls: 4,
        query_timeout: Duration::from_secs(5),
        max_oids_per_request: 24,
        policy: RolloverPolicy::default(),
    }
}

pub fn reading(value: u64, width: CounterWidth, at: tokio::time::Instant) -> Reading {
    Reading {
        value,
        width,
        alternate: None,
        at,
        timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    }
}
