// Raw varbind values as handed over by a query transport

use bytes::Bytes;

/// One varbind value. Transports map their native representation onto this; the
/// counter decoder turns it into an exact integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Integer(i64),
    Counter32(u32),
    Gauge32(u32),
    Counter64(u64),
    TimeTicks(u32),
    OctetString(Bytes),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    /// A value type no counter or status column uses (OID, IpAddress, Opaque, ...).
    Unsupported(&'static str),
}

impl RawValue {
    /// Text of an OctetString (lossy UTF-8, trailing NULs and whitespace trimmed).
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::OctetString(b) => Some(
                String::from_utf8_lossy(b)
                    .trim_end_matches(['\0', ' ', '\n', '\r'])
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(*v),
            RawValue::Counter32(v) | RawValue::Gauge32(v) | RawValue::TimeTicks(v) => {
                Some(*v as i64)
            }
            _ => None,
        }
    }

    /// Short type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Integer(_) => "Integer",
            RawValue::Counter32(_) => "Counter32",
            RawValue::Gauge32(_) => "Gauge32",
            RawValue::Counter64(_) => "Counter64",
            RawValue::TimeTicks(_) => "TimeTicks",
            RawValue::OctetString(_) => "OctetString",
            RawValue::Null => "Null",
            RawValue::NoSuchObject => "NoSuchObject",
            RawValue::NoSuchInstance => "NoSuchInstance",
            RawValue::EndOfMibView => "EndOfMibView",
            RawValue::Unsupported(kind) => kind,
        }
    }
}
