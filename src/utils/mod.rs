mod format;
mod plurals;

pub use format::{format_duration_secs, format_megabytes};
pub use plurals::pluralize;
