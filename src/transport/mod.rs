// Query transport seam. The collector core consumes `get` / `get_many`; it implements
// no SNMP wire protocol itself.

pub mod mock;
pub mod snmp;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::models::{Device, RawValue};

pub use mock::MockTransport;
pub use snmp::AsyncSnmpTransport;

#[async_trait]
pub trait SnmpTransport: Send + Sync {
    /// GET of a single instance OID.
    async fn get(&self, device: &Device, oid: &str) -> Result<RawValue, TransportError>;

    /// GET of several instance OIDs in one exchange where the transport supports it.
    /// Values come back in request order; per-OID exceptions are values, not errors.
    async fn get_many(
        &self,
        device: &Device,
        oids: &[String],
    ) -> Result<Vec<RawValue>, TransportError> {
        let mut values = Vec::with_capacity(oids.len());
        for oid in oids {
            values.push(self.get(device, oid).await?);
        }
        Ok(values)
    }
}
