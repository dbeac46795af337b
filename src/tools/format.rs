//! Currency rendering shared by the operations

/// `₱1,234.56` style: symbol, thousands separators, two decimals.
///
/// Digits come from the float's own decimal expansion, so very large
/// values are never clamped to an integer type's range.
pub fn format_money(symbol: &str, amount: f64) -> String {
    if !amount.is_finite() {
        return format!("{}{}", symbol, amount);
    }

    let mut digits = format!("{:.0}", (amount.abs() * 100.0).round());
    while digits.len() < 3 {
        digits.insert(0, '0');
    }
    let (whole, fraction) = digits.split_at(digits.len() - 2);

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let is_zero = digits.bytes().all(|b| b == b'0');
    let sign = if amount < 0.0 && !is_zero { "-" } else { "" };
    format!("{}{}{}.{}", sign, symbol, grouped, fraction)
}

/// Round to whole cents, the precision every amount is displayed at.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
