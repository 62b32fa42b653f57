// ===============================
// src/amount.rs
// ===============================
//
// Fixed-point amounts as raw u128 units:
// - native asset & USD values: 18 fractional digits (wad)
// - borrow asset: 6 fractional digits
// Parsing accepts plain decimal strings only ("1", "0.5", "700.01");
// signs, exponents and excess fractional digits are rejected.

pub const WAD: u128 = 1_000_000_000_000_000_000;
pub const NATIVE_DECIMALS: u32 = 18;
pub const BORROW_DECIMALS: u32 = 6;
/// 10^(18-6): rescales borrow-asset raw units to USD raw units (1:1 peg).
pub const BORROW_TO_USD_SCALE: u128 = 1_000_000_000_000;
/// Health factor marker for "no meaningful debt".
pub const HF_SATURATED: u128 = u128::MAX;

pub fn pow10(n: u32) -> u128 {
    10u128.pow(n)
}

/// Parse a decimal string into raw units with `decimals` fractional digits.
/// Returns `None` for anything that is not a plain non-negative decimal.
pub fn parse_units(text: &str, decimals: u32) -> Option<u128> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let (int_part, frac_part) = match t.split_once('.') {
        Some((i, f)) => (i, f),
        None => (t, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    if frac_part.len() as u32 > decimals {
        return None;
    }
    let int_v: u128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let frac_v: u128 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    let scaled_frac = frac_v.checked_mul(pow10(decimals - frac_part.len() as u32))?;
    int_v.checked_mul(pow10(decimals))?.checked_add(scaled_frac)
}

/// Like `parse_units` but additionally requires the amount to be > 0.
pub fn parse_positive(text: &str, decimals: u32) -> Option<u128> {
    parse_units(text, decimals).filter(|v| *v > 0)
}

/// Raw units back to a decimal string, trailing zeros trimmed.
pub fn format_units(raw: u128, decimals: u32) -> String {
    let base = pow10(decimals);
    let int = raw / base;
    let frac = raw % base;
    if frac == 0 {
        return int.to_string();
    }
    let frac_s = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", int, frac_s.trim_end_matches('0'))
}

/// Borrow-asset raw units (6 digits) expressed in USD raw units (18 digits).
pub fn scale_borrow_to_usd(raw: u128) -> u128 {
    raw.saturating_mul(BORROW_TO_USD_SCALE)
}

/// Display rule from the dashboard: "> 100" when saturated or above 100.0,
/// otherwise four decimal places.
pub fn format_health_factor(raw: u128) -> String {
    if raw == HF_SATURATED || raw > 100 * WAD {
        return "> 100".to_string();
    }
    let int = raw / WAD;
    let frac4 = (raw % WAD) / pow10(14);
    format!("{}.{:04}", int, frac4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(parse_units("1", 18), Some(WAD));
        assert_eq!(parse_units("1.0", 18), Some(WAD));
        assert_eq!(parse_units("0.5", 18), Some(WAD / 2));
        assert_eq!(parse_units("700", 6), Some(700_000_000));
        assert_eq!(parse_units("700.01", 6), Some(700_010_000));
        assert_eq!(parse_units(".25", 6), Some(250_000));
        assert_eq!(parse_units(" 2 ", 6), Some(2_000_000));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", " ", ".", "-1", "+1", "1e5", "abc", "1.2.3", "0x10"] {
            assert_eq!(parse_units(bad, 18), None, "accepted {:?}", bad);
        }
        // more fractional digits than the asset carries
        assert_eq!(parse_units("1.0000001", 6), None);
    }

    #[test]
    fn positive_excludes_zero() {
        assert_eq!(parse_positive("0", 6), None);
        assert_eq!(parse_positive("0.0", 18), None);
        assert_eq!(parse_positive("0.000001", 6), Some(1));
    }

    #[test]
    fn formats_and_trims() {
        assert_eq!(format_units(WAD, 18), "1");
        assert_eq!(format_units(WAD / 2, 18), "0.5");
        assert_eq!(format_units(700_010_000, 6), "700.01");
        assert_eq!(format_units(0, 6), "0");
    }

    #[test]
    fn borrow_usd_rescale() {
        // 700 units of the 6-digit asset == 700 USD in wad under the peg
        assert_eq!(scale_borrow_to_usd(700_000_000), 700 * WAD);
    }

    #[test]
    fn health_factor_display() {
        assert_eq!(format_health_factor(HF_SATURATED), "> 100");
        assert_eq!(format_health_factor(101 * WAD), "> 100");
        assert_eq!(format_health_factor(WAD + WAD / 2), "1.5000");
        assert_eq!(format_health_factor(WAD * 9 / 10), "0.9000");
    }
}
