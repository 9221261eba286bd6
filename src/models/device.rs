// Device and interface target models

use serde::{Deserialize, Serialize};

use crate::vendor::VendorSelection;

/// SNMP credentials, tagged by protocol version. Stored as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", rename_all = "lowercase")]
pub enum Credentials {
    V1 {
        community: String,
    },
    V2c {
        community: String,
    },
    V3 {
        user: String,
        #[serde(default)]
        auth_protocol: Option<String>,
        #[serde(default)]
        auth_password: Option<String>,
        #[serde(default)]
        priv_protocol: Option<String>,
        #[serde(default)]
        priv_password: Option<String>,
    },
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::V2c {
            community: "public".into(),
        }
    }
}

impl Credentials {
    /// USM security level name for v3 ("noAuthNoPriv", "authNoPriv", "authPriv").
    pub fn security_level(&self) -> Option<&'static str> {
        match self {
            Credentials::V3 {
                auth_password,
                priv_password,
                ..
            } => Some(match (auth_password.is_some(), priv_password.is_some()) {
                (true, true) => "authPriv",
                (true, false) => "authNoPriv",
                _ => "noAuthNoPriv",
            }),
            _ => None,
        }
    }
}

/// One selected interface of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTarget {
    pub device_id: String,
    pub index: u32,
    /// Empty when the name should be read from the device.
    pub name: String,
}

/// A validated device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    /// Transport address, `host` or `host:port`.
    pub host: String,
    pub credentials: Credentials,
    pub vendor: VendorSelection,
    pub enabled: bool,
    pub interfaces: Vec<InterfaceTarget>,
}

impl Device {
    /// Identity of the configuration inputs that vendor resolution depends on.
    pub fn resolution_fingerprint(&self) -> String {
        format!("{}|{}", self.host, self.vendor)
    }

    pub fn interface(&self, index: u32) -> Option<&InterfaceTarget> {
        self.interfaces.iter().find(|i| i.index == index)
    }
}
