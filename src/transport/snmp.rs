// Transport over the async-snmp client: one UDP session per device, reused across cycles.
// Retries stay with the poller, so every client is built with `Retry::none()`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::time::Duration;

use async_snmp::client::Retry;
use async_snmp::v3::{AuthProtocol, PrivProtocol};
use async_snmp::{Auth, Client, Oid, Value, VarBind};
use async_trait::async_trait;

use super::SnmpTransport;
use crate::error::TransportError;
use crate::models::{Credentials, Device, RawValue};

pub const DEFAULT_PORT: u16 = 161;

struct CachedClient {
    target: String,
    credentials: Credentials,
    client: Client,
}

pub struct AsyncSnmpTransport {
    timeout: Duration,
    max_oids_per_request: usize,
    default_port: u16,
    clients: RwLock<HashMap<String, CachedClient>>,
}

impl AsyncSnmpTransport {
    pub fn new(timeout: Duration, max_oids_per_request: usize, default_port: u16) -> Self {
        Self {
            timeout,
            max_oids_per_request: max_oids_per_request.max(1),
            default_port,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Session for `device`; rebuilt when its address or credentials changed.
    async fn client(&self, device: &Device) -> Result<Client, TransportError> {
        let target = target_address(&device.host, self.default_port);
        if let Ok(clients) = self.clients.read()
            && let Some(cached) = clients.get(&device.id)
            && cached.target == target
            && cached.credentials == device.credentials
        {
            return Ok(cached.client.clone());
        }

        let auth = auth_for(device)?;
        let client = Client::builder(target.clone(), auth)
            .timeout(self.timeout)
            .retry(Retry::none())
            .max_oids_per_request(self.max_oids_per_request)
            .connect()
            .await
            .map_err(|e| transport_error(&device.host, &e))?;
        tracing::debug!(device = %device.id, %target, "snmp session opened");

        if let Ok(mut clients) = self.clients.write() {
            clients.insert(
                device.id.clone(),
                CachedClient {
                    target,
                    credentials: device.credentials.clone(),
                    client: client.clone(),
                },
            );
        }
        Ok(client)
    }

    fn forget(&self, device: &Device) {
        if let Ok(mut clients) = self.clients.write() {
            clients.remove(&device.id);
        }
    }

    fn failed(&self, device: &Device, error: &async_snmp::Error) -> TransportError {
        let mapped = transport_error(&device.host, error);
        if matches!(mapped, TransportError::Unreachable { .. }) {
            self.forget(device);
        }
        mapped
    }
}

#[async_trait]
impl SnmpTransport for AsyncSnmpTransport {
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
        let requested = oids
            .iter()
            .map(|oid| {
                Oid::parse(oid).map_err(|e| TransportError::Setup {
                    host: device.host.clone(),
                    reason: format!("invalid OID '{}': {}", oid, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let client = self.client(device).await?;
        let varbinds = client
            .get_many(&requested)
            .await
            .map_err(|e| self.failed(device, &e))?;
        in_request_order(&device.host, &requested, varbinds)
    }
}

/// Checks that the response answers the request varbind by varbind.
pub fn in_request_order(
    host: &str,
    requested: &[Oid],
    varbinds: Vec<VarBind>,
) -> Result<Vec<RawValue>, TransportError> {
    if varbinds.len() != requested.len() {
        return Err(TransportError::Malformed {
            host: host.to_string(),
            reason: format!(
                "asked for {} varbinds, got {}",
                requested.len(),
                varbinds.len()
            ),
        });
    }
    requested
        .iter()
        .zip(varbinds)
        .map(|(oid, vb)| {
            if &vb.oid != oid {
                return Err(TransportError::Malformed {
                    host: host.to_string(),
                    reason: format!("expected {} in response, got {}", oid, vb.oid),
                });
            }
            Ok(raw_value(vb.value))
        })
        .collect()
}

/// `host`, `host:port`, an IP literal or a socket address -> a `host:port` target.
pub fn target_address(host: &str, default_port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, default_port),
        Ok(IpAddr::V4(_)) => format!("{}:{}", host, default_port),
        Err(_) => match host.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() && port.parse::<u16>().is_ok() => {
                host.to_string()
            }
            _ => format!("{}:{}", host, default_port),
        },
    }
}

/// Session authentication for the device's credentials.
pub fn auth_for(device: &Device) -> Result<Auth, TransportError> {
    let setup = |reason: String| TransportError::Setup {
        host: device.host.clone(),
        reason,
    };
    match &device.credentials {
        Credentials::V1 { community } => Ok(Auth::v1(community.clone())),
        Credentials::V2c { community } => Ok(Auth::v2c(community.clone())),
        Credentials::V3 {
            user,
            auth_protocol,
            auth_password,
            priv_protocol,
            priv_password,
        } => {
            let mut usm = Auth::usm(user.clone());
            match (auth_protocol, auth_password) {
                (Some(protocol), Some(password)) => {
                    let protocol = protocol
                        .parse::<AuthProtocol>()
                        .map_err(|e| setup(e.to_string()))?;
                    usm = usm.auth(protocol, password.clone());
                }
                (None, None) => {}
                _ => return Err(setup("v3 auth needs both protocol and password".into())),
            }
            match (priv_protocol, priv_password) {
                (Some(_), Some(_)) if auth_protocol.is_none() => {
                    return Err(setup("v3 privacy requires authentication".into()));
                }
                (Some(protocol), Some(password)) => {
                    let protocol = protocol
                        .parse::<PrivProtocol>()
                        .map_err(|e| setup(e.to_string()))?;
                    usm = usm.privacy(protocol, password.clone());
                }
                (None, None) => {}
                _ => return Err(setup("v3 privacy needs both protocol and password".into())),
            }
            Ok(usm.into())
        }
    }
}

pub fn raw_value(value: Value) -> RawValue {
    match value {
        Value::Integer(v) => RawValue::Integer(v as i64),
        Value::OctetString(bytes) => RawValue::OctetString(bytes),
        Value::Null => RawValue::Null,
        Value::Counter32(v) => RawValue::Counter32(v),
        Value::Gauge32(v) => RawValue::Gauge32(v),
        Value::TimeTicks(v) => RawValue::TimeTicks(v),
        Value::Counter64(v) => RawValue::Counter64(v),
        Value::NoSuchObject => RawValue::NoSuchObject,
        Value::NoSuchInstance => RawValue::NoSuchInstance,
        Value::EndOfMibView => RawValue::EndOfMibView,
        Value::ObjectIdentifier(_) => RawValue::Unsupported("ObjectIdentifier"),
        Value::IpAddress(_) => RawValue::Unsupported("IpAddress"),
        Value::Opaque(_) => RawValue::Unsupported("Opaque"),
        _ => RawValue::Unsupported("Unknown"),
    }
}

/// Client error -> transport error. Only `Timeout` is retried by the poller.
pub fn transport_error(host: &str, error: &async_snmp::Error) -> TransportError {
    let host = host.to_string();
    match error {
        async_snmp::Error::Timeout { elapsed, .. } => TransportError::Timeout {
            host,
            after: *elapsed,
        },
        async_snmp::Error::Snmp { status, oid, .. } => TransportError::ErrorStatus {
            host,
            status: match oid {
                Some(oid) => format!("{} at {}", status, oid),
                None => status.to_string(),
            },
        },
        async_snmp::Error::Network { .. } => TransportError::Unreachable {
            host,
            reason: error.to_string(),
        },
        async_snmp::Error::Auth { .. } => TransportError::ErrorStatus {
            host,
            status: error.to_string(),
        },
        async_snmp::Error::Config(_) | async_snmp::Error::InvalidOid(_) => {
            TransportError::Setup {
                host,
                reason: error.to_string(),
            }
        }
        _ => TransportError::Malformed {
            host,
            reason: error.to_string(),
        },
    }
}
