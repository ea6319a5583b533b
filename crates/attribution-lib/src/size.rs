//! Byte count formatting

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format bytes as a human-readable string with binary units
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for (i, unit) in UNITS.iter().enumerate() {
        if value < 1024.0 || i == UNITS.len() - 1 {
            if i == 0 {
                return format!("{} {}", bytes, unit);
            }
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    unreachable!("loop returns on the last unit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_format_bytes_caps_at_pib() {
        assert_eq!(format_bytes(2048 * 1024u64.pow(5)), "2048.0 PiB");
    }
}
