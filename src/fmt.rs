use rust_decimal::{Decimal, RoundingStrategy};

/// Format an amount with thousands separators and its currency code: 1,234.56 EUR
pub fn money(val: Decimal, currency: &str) -> String {
    let rounded = val.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let cents = format!("{:.2}", rounded.abs());
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((&cents, "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    let sign = if negative { "-" } else { "" };
    format!("{sign}{with_commas}.{dec_part} {currency}")
}

/// Like [`money`], or a dash when there is no amount.
pub fn money_opt(val: Option<Decimal>, currency: &str) -> String {
    val.map(|v| money(v, currency)).unwrap_or_else(|| "-".to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
