//! Kubernetes resource quantities as byte counts

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Parse a storage quantity ("5Gi", "1073741824", "2G", "512Mi") into bytes.
///
/// Fractional values and exponent notation are not used by storage
/// requests in this harness and are rejected.
pub fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits.parse().ok()?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

pub fn quantity_bytes(q: &Quantity) -> Option<u64> {
    parse_bytes(&q.0)
}

/// Round a byte count up to whole GiB.
pub fn round_up_gib(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// Parse a human-readable size as printed by `df -h` ("5.0G", "976M", "2T").
///
/// `df -h` uses powers of 1024 and single-letter suffixes.
pub fn parse_df_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, multiplier) = match value.chars().last()? {
        'K' => (&value[..value.len() - 1], 1u64 << 10),
        'M' => (&value[..value.len() - 1], 1 << 20),
        'G' => (&value[..value.len() - 1], 1 << 30),
        'T' => (&value[..value.len() - 1], 1 << 40),
        c if c.is_ascii_digit() => (value, 1),
        _ => return None,
    };
    let number: f64 = number.parse().ok()?;
    if number < 0.0 {
        return None;
    }
    Some((number * multiplier as f64).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_bytes("1Gi"), Some(GIB));
        assert_eq!(parse_bytes("5Gi"), Some(5 * GIB));
        assert_eq!(parse_bytes("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_bytes("1073741824"), Some(GIB));
    }

    #[test]
    fn test_parse_decimal_suffixes() {
        assert_eq!(parse_bytes("2G"), Some(2_000_000_000));
        assert_eq!(parse_bytes("10k"), Some(10_000));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(parse_bytes("1.5Gi"), None);
        assert_eq!(parse_bytes("Gi"), None);
        assert_eq!(parse_bytes("5Xi"), None);
    }

    #[test]
    fn test_round_up_gib() {
        assert_eq!(round_up_gib(GIB), 1);
        assert_eq!(round_up_gib(GIB + 1), 2);
        assert_eq!(round_up_gib(0), 0);
    }

    #[test]
    fn test_parse_df_size() {
        assert_eq!(parse_df_size("5.0G"), Some(5 * GIB));
        assert_eq!(parse_df_size("976M"), Some(976 * 1024 * 1024));
        assert_eq!(round_up_gib(parse_df_size("4.9G").unwrap()), 5);
        assert_eq!(parse_df_size("4096"), Some(4096));
        assert_eq!(parse_df_size(""), None);
        assert_eq!(parse_df_size("abc"), None);
    }
}
