//! Storefront price text: currency symbols and locale separators.

/// Symbol to ISO code, longest symbols first so `R$` wins over `$`.
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("CDN$", "CAD"),
    ("Mex$", "MXN"),
    ("CLP$", "CLP"),
    ("COL$", "COP"),
    ("NZ$", "NZD"),
    ("HK$", "HKD"),
    ("S/.", "PEN"),
    ("CHF", "CHF"),
    ("A$", "AUD"),
    ("R$", "BRL"),
    ("R＄", "BRL"),
    ("zł", "PLN"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₩", "KRW"),
    ("₹", "INR"),
    ("₽", "RUB"),
    ("₴", "UAH"),
    ("₺", "TRY"),
    ("$", "USD"),
];

const FREE_WORDS: &[&str] = &["free", "grátis", "gratis", "gratuito"];

/// ISO code for the first known symbol found in `text`, else `fallback`.
pub fn currency_code(text: &str, fallback: &str) -> String {
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| (*code).to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Parses storefront price text into minor units.
///
/// When both `,` and `.` appear the rightmost one is the decimal separator.
/// A lone separator followed by exactly three digits groups thousands;
/// otherwise it is the decimal separator.
pub fn parse_minor_units(text: &str) -> Option<i64> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if FREE_WORDS.iter().any(|w| lower == *w) {
        return Some(0);
    }

    let cleaned: String = lower
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == ',' || c == '.');
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let decimal_at = decimal_separator_index(cleaned);
    let (whole, fraction) = match decimal_at {
        Some(idx) => (&cleaned[..idx], &cleaned[idx + 1..]),
        None => (cleaned, ""),
    };
    let whole: String = whole.chars().filter(char::is_ascii_digit).collect();
    let fraction: String = fraction.chars().filter(char::is_ascii_digit).collect();

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction[..2].parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(cents)
}

fn decimal_separator_index(s: &str) -> Option<usize> {
    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    match (last_comma, last_dot) {
        (Some(c), Some(d)) => Some(c.max(d)),
        (Some(idx), None) | (None, Some(idx)) => {
            let sep = &s[idx..=idx];
            let occurrences = s.matches(sep).count();
            let digits_after = s.len() - idx - 1;
            if occurrences > 1 || digits_after == 3 {
                None
            } else {
                Some(idx)
            }
        }
        (None, None) => None,
    }
}
