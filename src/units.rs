//! IEC size parsing and formatting
//!
//! lsblk prints human sizes (`320G`, `512M`, `1.8T`) and users type the same
//! notation at the swap-file prompt. Anything that does not parse is an
//! explicit `InvalidSize`, never a silent zero.

use crate::error::{LayoutError, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;
pub const PIB: u64 = 1024 * TIB;

/// Parse an IEC-prefixed size into bytes.
///
/// Accepts a bare byte count (`4096`), single-letter suffixes (`512M`, `1.5T`),
/// and the spelled forms (`10GiB`, `10G B`). Suffixes are case-insensitive and a
/// comma is accepted as the decimal separator, as some locales make lsblk emit it.
pub fn parse_iec_size(input: &str) -> Result<u64> {
    let invalid = || LayoutError::InvalidSize(input.to_string());

    let compact: String = input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if compact.is_empty() {
        return Err(invalid());
    }

    let split = compact
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(compact.len());
    let (number, suffix) = compact.split_at(split);
    if number.is_empty() || number.matches('.').count() > 1 {
        return Err(invalid());
    }

    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        "p" | "pb" | "pib" => PIB,
        _ => return Err(invalid()),
    };

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

/// Format a byte count with the largest IEC unit that keeps the value >= 1.
pub fn format_iec(bytes: u64) -> String {
    const UNITS: [(u64, &str); 5] = [
        (PIB, "PiB"),
        (TIB, "TiB"),
        (GIB, "GiB"),
        (MIB, "MiB"),
        (KIB, "KiB"),
    ];

    for (unit, name) in UNITS {
        if bytes >= unit {
            let value = bytes as f64 / unit as f64;
            return if bytes % unit == 0 {
                format!("{} {}", bytes / unit, name)
            } else {
                format!("{:.1} {}", value, name)
            };
        }
    }
    format!("{} B", bytes)
}

/// Size argument for an sfdisk script line, in whole KiB.
pub fn sfdisk_size(bytes: u64) -> String {
    format!("{}KiB", bytes / KIB)
}
