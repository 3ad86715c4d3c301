use comfy_table::{presets::UTF8_FULL_CONDENSED, Attribute, Cell, ContentArrangement, Table};

use crate::backup::ExportStats;
use crate::utils::{format_duration_secs, format_megabytes};

/// Two-column table with a bold label column.
pub fn key_value_table<K, V>(rows: impl IntoIterator<Item = (K, V)>) -> Table
where
    K: AsRef<str>,
    V: ToString,
{
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Disabled);
    for (key, value) in rows {
        table.add_row(vec![
            Cell::new(key.as_ref()).add_attribute(Attribute::Bold),
            Cell::new(value.to_string()),
        ]);
    }
    table
}

/// Request statistics shared by the per-target and final summaries.
pub fn stats_table(leading: Vec<(&str, String)>, stats: &ExportStats) -> Table {
    let rows = leading.into_iter().chain([
        ("duration", format_duration_secs(stats.elapsed_seconds)),
        ("max request size (MB)", format_megabytes(stats.max_request_size)),
        ("total request size (MB)", format_megabytes(stats.total_request_size)),
        (
            "total objects (not counting nested)",
            stats.total_object_count.to_string(),
        ),
    ]);
    key_value_table(rows)
}
