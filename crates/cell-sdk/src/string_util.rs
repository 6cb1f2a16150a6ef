use std::time::Duration;

/// Marker appended to messages cut by [`StringUtil::truncate_with_marker`].
pub const TRUNCATED_MARKER: &str = " (error truncated)";

const BYTE_UNITS: &[(u64, &str)] = &[
    (1 << 60, "E"),
    (1 << 50, "P"),
    (1 << 40, "T"),
    (1 << 30, "G"),
    (1 << 20, "M"),
    (1 << 10, "K"),
    (1, "B"),
];

/// String formatting helpers for user-facing container log lines.
pub struct StringUtil;

impl StringUtil {
    /// Human-readable byte size with a single-letter unit.
    ///
    /// One decimal place is kept and a trailing `.0` dropped, so `42` becomes
    /// `"42B"`, `1024` becomes `"1K"` and `1536` becomes `"1.5K"`.
    pub fn format_byte_size(bytes: u64) -> String {
        if bytes == 0 {
            return "0B".to_string();
        }
        let (unit_size, unit) = BYTE_UNITS
            .iter()
            .copied()
            .find(|(size, _)| bytes >= *size)
            .unwrap_or((1, "B"));

        let value = format!("{:.1}", bytes as f64 / unit_size as f64);
        let value = value.strip_suffix(".0").unwrap_or(&value);
        format!("{value}{unit}")
    }

    /// Cut `message` to at most `max_len` bytes (on a char boundary) and
    /// append [`TRUNCATED_MARKER`]. Shorter messages are returned unchanged.
    pub fn truncate_with_marker(message: &str, max_len: usize) -> String {
        if message.len() <= max_len {
            return message.to_string();
        }
        let mut end = max_len;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}{}", &message[..end], TRUNCATED_MARKER)
    }

    /// Compact duration text such as `"500ms"`, `"1s"`, `"1.5s"` or `"2m30s"`.
    pub fn format_duration(duration: Duration) -> String {
        let nanos = duration.as_nanos();
        if nanos == 0 {
            return "0s".to_string();
        }
        if nanos < 1_000 {
            return format!("{nanos}ns");
        }
        if nanos < 1_000_000 {
            return format!("{}µs", trim_fraction(nanos as f64 / 1_000.0));
        }
        if nanos < 1_000_000_000 {
            return format!("{}ms", trim_fraction(nanos as f64 / 1_000_000.0));
        }

        let total_secs = duration.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = (total_secs % 60) as f64 + f64::from(duration.subsec_nanos()) / 1e9;
        let seconds = trim_fraction(seconds);

        if hours > 0 {
            format!("{hours}h{minutes}m{seconds}s")
        } else if minutes > 0 {
            format!("{minutes}m{seconds}s")
        } else {
            format!("{seconds}s")
        }
    }
}

fn trim_fraction(value: f64) -> String {
    let text = format!("{value:.9}");
    let text = text.trim_end_matches('0');
    text.trim_end_matches('.').to_string()
}
