pub fn parse_count(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    parse_with_unit(text, suffix_multiplier)
        .or_else(|| parse_with_unit(text, east_asian_multiplier))
        .or_else(|| parse_grouped(text))
}

pub fn count_from_label(label: &str) -> Option<u64> {
    let start = label.find(|c: char| c.is_ascii_digit())?;
    let rest = &label[start..];
    let number_end = rest
        .find(|c: char| !is_number_char(c))
        .unwrap_or(rest.len());

    let after = &rest[number_end..];
    let unit_start = after.trim_start();
    let gap = after.len() - unit_start.len();
    let unit_len = unit_start
        .chars()
        .next()
        .filter(|c| suffix_multiplier(*c).is_some() || east_asian_multiplier(*c).is_some())
        .map_or(0, char::len_utf8);

    parse_count(&rest[..number_end + gap + unit_len])
}

fn suffix_multiplier(unit: char) -> Option<f64> {
    match unit.to_ascii_uppercase() {
        'K' => Some(1e3),
        'M' => Some(1e6),
        'B' => Some(1e9),
        _ => None,
    }
}

fn east_asian_multiplier(unit: char) -> Option<f64> {
    match unit {
        '万' => Some(1e4),
        '億' | '亿' => Some(1e8),
        _ => None,
    }
}

fn parse_with_unit(text: &str, multiplier: fn(char) -> Option<f64>) -> Option<u64> {
    let (number, rest) = leading_decimal(text)?;
    let mut chars = rest.chars();
    let factor = chars.next().and_then(multiplier)?;
    if chars.next().is_some_and(is_word_char) {
        return None;
    }
    to_count((number * factor).round())
}

fn leading_decimal(text: &str) -> Option<(f64, &str)> {
    let int_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if int_end == 0 {
        return None;
    }

    let mut end = int_end;
    if let Some(sep) = text[int_end..].chars().next().filter(|c| *c == '.' || *c == ',') {
        let fraction = &text[int_end + sep.len_utf8()..];
        let fraction_len = fraction
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(fraction.len());
        if fraction_len > 0 {
            end = int_end + sep.len_utf8() + fraction_len;
        }
    }

    let number = text[..end].replace(',', ".").parse::<f64>().ok()?;
    Some((number, &text[end..]))
}

fn parse_grouped(text: &str) -> Option<u64> {
    let chars: Vec<char> = text
        .chars()
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect();

    let mut digits = String::with_capacity(chars.len());
    for (idx, &c) in chars.iter().enumerate() {
        let separator = c == '.' || c == ',' || c.is_whitespace();
        if separator && starts_digit_group(&chars[idx + 1..]) {
            continue;
        }
        digits.push(c);
    }

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// Exactly three digits followed by a non-digit or the end.
fn starts_digit_group(rest: &[char]) -> bool {
    rest.len() >= 3
        && rest[..3].iter().all(char::is_ascii_digit)
        && rest.get(3).is_none_or(|c| !c.is_ascii_digit())
}

fn to_count(value: f64) -> Option<u64> {
    if value.is_finite() && value >= 0.0 && value < u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || c == '.' || c == ','
}
