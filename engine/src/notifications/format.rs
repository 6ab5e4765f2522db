//! Formatting helpers shared by channel adapters

use chrono::{DateTime, Utc};

/// Prefix `text` with `decoration` when decoration is enabled
pub fn decorate(enabled: bool, decoration: &str, text: &str) -> String {
    if enabled && !decoration.is_empty() {
        format!("{} {}", decoration, text)
    } else {
        text.to_string()
    }
}

/// Escape text for Telegram's HTML parse mode
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// e.g. `Oct 19, 2026`
pub fn long_date(ts: &DateTime<Utc>) -> String {
    ts.format("%b %-d, %Y").to_string()
}

/// e.g. `1:05:09 PM`
pub fn long_time(ts: &DateTime<Utc>) -> String {
    ts.format("%-I:%M:%S %p").to_string()
}

/// e.g. `2026-10-19 13:05:09 UTC`
pub fn date_time(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decorate() {
        assert_eq!(decorate(true, "✅", "Done"), "✅ Done");
        assert_eq!(decorate(false, "✅", "Done"), "Done");
        assert_eq!(decorate(true, "", "Done"), "Done");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>a & b</b>"), "&lt;b&gt;a &amp; b&lt;/b&gt;");
    }

    #[test]
    fn test_date_formats() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 7, 13, 5, 9).unwrap();
        assert_eq!(long_date(&ts), "Mar 7, 2026");
        assert_eq!(long_time(&ts), "1:05:09 PM");
        assert_eq!(date_time(&ts), "2026-03-07 13:05:09 UTC");
    }
}
