/// Bytes as decimal megabytes with three decimals, e.g. `1.250`.
pub fn format_megabytes(bytes: usize) -> String {
    format!("{:.3}", bytes as f64 / 1_000_000.0)
}

/// Seconds as `MM:SS.s`, or `HH:MM:SS` past an hour.
pub fn format_duration_secs(total_secs: f64) -> String {
    let total_secs = total_secs.max(0.0);
    let whole = total_secs as u64;
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    if hours > 0 {
        let seconds = whole % 60;
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        let seconds = total_secs - (hours * 3600 + minutes * 60) as f64;
        format!("{minutes:02}:{seconds:04.1}")
    }
}
