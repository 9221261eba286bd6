// Raw wire value -> exact unsigned counter of a declared width.
// Every wide value goes through a 128-bit accumulator before narrowing to u64.

use crate::error::DecodeError;
use crate::models::RawValue;
use crate::vendor::CounterWidth;

/// Decodes one counter response.
///
/// Accepted shapes per width:
/// - 32-bit: Counter32, Gauge32, a non-negative Integer below 2^32, or up to 4
///   significant big-endian bytes.
/// - 64-bit: Counter64, a non-negative Integer, or up to 8 significant big-endian bytes.
///
/// Extra leading zero bytes are tolerated (BER-style sign padding). Any failure on a
/// 64-bit OID means the caller should fall back to the 32-bit column this cycle.
pub fn decode_counter(raw: &RawValue, width: CounterWidth) -> Result<u64, DecodeError> {
    match (raw, width) {
        (RawValue::Counter32(v) | RawValue::Gauge32(v), CounterWidth::Bits32) => Ok(*v as u64),
        (RawValue::Counter32(_) | RawValue::Gauge32(_), CounterWidth::Bits64) => {
            Err(DecodeError::WidthMismatch {
                width: 64,
                detail: format!("{} on a 64-bit column", raw.kind()),
            })
        }
        (RawValue::Counter64(v), _) => fit_width(*v as u128, width),
        (RawValue::Integer(v), _) => {
            if *v < 0 {
                Err(DecodeError::Negative(*v))
            } else {
                fit_width(*v as u128, width)
            }
        }
        (RawValue::OctetString(bytes), _) => fold_be_bytes(bytes, width),
        (RawValue::NoSuchObject, _) => Err(DecodeError::Absent("noSuchObject")),
        (RawValue::NoSuchInstance, _) => Err(DecodeError::Absent("noSuchInstance")),
        (RawValue::EndOfMibView, _) => Err(DecodeError::Absent("endOfMibView")),
        (RawValue::Null, _) => Err(DecodeError::Absent("null")),
        (RawValue::TimeTicks(_), _) => Err(DecodeError::UnsupportedShape("TimeTicks")),
        (RawValue::Unsupported(kind), _) => Err(DecodeError::UnsupportedShape(kind)),
    }
}

/// Folds a big-endian byte sequence most-significant byte first:
/// `value = value * 256 + byte`.
pub fn fold_be_bytes(bytes: &[u8], width: CounterWidth) -> Result<u64, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::UnsupportedShape("empty byte sequence"));
    }
    let first_significant = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first_significant..];
    if significant.len() > width.byte_len() {
        return Err(DecodeError::WidthMismatch {
            width: width.bits(),
            detail: format!("{} significant bytes", significant.len()),
        });
    }
    let value = significant
        .iter()
        .fold(0u128, |acc, b| acc * 256 + *b as u128);
    fit_width(value, width)
}

fn fit_width(value: u128, width: CounterWidth) -> Result<u64, DecodeError> {
    if value > width.max_value() as u128 {
        return Err(DecodeError::WidthMismatch {
            width: width.bits(),
            detail: format!("value {} exceeds {}", value, width.max_value()),
        });
    }
    u64::try_from(value).map_err(|_| DecodeError::WidthMismatch {
        width: width.bits(),
        detail: format!("value {} exceeds u64", value),
    })
}
