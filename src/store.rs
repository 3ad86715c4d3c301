//! Buffered CSV sink for flattened records, and the matching reader.
//!
//! Files have a two-column `"path","value"` header followed by one quoted
//! row per record. Embedded quotes are doubled (RFC 4180), so any value
//! survives a round trip. Older traversal exports put a space after the
//! comma and did not escape quotes; the reader accepts those rows too.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, ReaderBuilder, StringRecord, Trim, WriterBuilder};

use crate::error::{FirebakError, Result};
use crate::tree::Scalar;

pub const SHARD_FLUSH_THRESHOLD: usize = 200;
pub const TRAVERSAL_FLUSH_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvDialect {
    /// Written while paginating annotated shards.
    Shard,
    /// Written while walking a collection node by node.
    Traversal,
}

impl CsvDialect {
    pub fn header(self) -> &'static str {
        match self {
            CsvDialect::Shard => "\"path\",\"value\"",
            CsvDialect::Traversal => "\"path\", \"value\"",
        }
    }

    pub fn flush_threshold(self) -> usize {
        match self {
            CsvDialect::Shard => SHARD_FLUSH_THRESHOLD,
            CsvDialect::Traversal => TRAVERSAL_FLUSH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    pub path: String,
    pub value: Scalar,
}

pub struct RecordStore {
    path: PathBuf,
    dialect: CsvDialect,
    buffer: BTreeMap<String, Scalar>,
    writer: csv::Writer<fs::File>,
    rows_written: usize,
    flushes: usize,
}

impl RecordStore {
    /// Truncates `path` and writes the header line.
    pub fn create(path: &Path, dialect: CsvDialect) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|err| FirebakError::file_io("failed to create", path, err))?;
        writeln!(file, "{}", dialect.header())
            .map_err(|err| FirebakError::file_io("failed to write header to", path, err))?;
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|err| FirebakError::file_io("failed to open", path, err))?;
        let writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::Always)
            .from_writer(file);

        Ok(Self {
            path: path.to_path_buf(),
            dialect,
            buffer: BTreeMap::new(),
            writer,
            rows_written: 0,
            flushes: 0,
        })
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Buffers records. A path seen again replaces the buffered value.
    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = (String, Scalar)>,
    {
        self.buffer.extend(records);
    }

    /// Flushes when more than `threshold` records are buffered.
    pub fn flush_if_over(&mut self, threshold: usize) -> Result<bool> {
        if self.buffer.len() > threshold {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flushes using the dialect's threshold.
    pub fn flush_if_full(&mut self) -> Result<bool> {
        self.flush_if_over(self.dialect.flush_threshold())
    }

    /// Appends every buffered record to the file and clears the buffer.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        let count = buffer.len();
        for (path, value) in buffer {
            self.writer
                .write_record([path.as_str(), value.to_string().as_str()])
                .map_err(|err| self.io_error(err))?;
        }
        self.writer.flush().map_err(|err| {
            FirebakError::file_io("failed to flush", &self.path, err)
        })?;
        self.rows_written += count;
        self.flushes += 1;
        tracing::debug!(file = %self.path.display(), rows = count, "flushed records");
        Ok(())
    }

    /// Final unconditional flush. Returns the number of rows in the file.
    pub fn close(mut self) -> Result<usize> {
        self.flush()?;
        tracing::debug!(
            file = %self.path.display(),
            rows = self.rows_written,
            flushes = self.flushes,
            "closed record file"
        );
        Ok(self.rows_written)
    }

    fn io_error(&self, err: csv::Error) -> FirebakError {
        FirebakError::file_io("failed to write", &self.path, io::Error::from(err))
    }
}

/// Reads a backup file written in either dialect.
///
/// Values are typed by [`Scalar::infer`]: the file does not record whether a
/// value was a string, so a string such as `"42"` or `"true"` comes back as a
/// number or a boolean.
///
/// Rows are RFC 4180 unless the header is the spaced traversal form, where a
/// row may also be an older unescaped line such as `"a/b", "value"`. Such rows
/// are told apart from escaped ones by re-encoding the parsed fields and
/// comparing with the raw line.
pub fn read_records(path: &Path) -> Result<Vec<FlatRecord>> {
    let text =
        fs::read_to_string(path).map_err(|err| FirebakError::file_io("failed to read", path, err))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::None)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    let mut raw = StringRecord::new();
    let mut first = true;
    let mut dialect = CsvDialect::Shard;
    loop {
        let more = reader
            .read_record(&mut raw)
            .map_err(|err| read_error(path, err))?;
        if !more {
            break;
        }
        let (start, line) = raw
            .position()
            .map(|p| (p.byte() as usize, p.line()))
            .unwrap_or_default();
        let end = reader.position().byte() as usize;

        if std::mem::take(&mut first) {
            if let Some(header) = header_dialect(&raw) {
                dialect = header;
                continue;
            }
        }
        if raw.iter().all(str::is_empty) {
            continue;
        }

        let row = text.get(start..end).unwrap_or_default();
        let legacy = dialect == CsvDialect::Traversal && !is_escaped_row(&raw, row);
        let fields: Vec<String> = raw
            .iter()
            .map(|field| if legacy { legacy_unquote(field) } else { field.to_string() })
            .collect();

        if fields.len() != 2 {
            return Err(FirebakError::MalformedRecord {
                path: path.to_path_buf(),
                line,
                reason: format!("expected 2 fields, found {}", fields.len()),
            });
        }
        let mut fields = fields.into_iter();
        let record_path = fields.next().unwrap_or_default();
        let value = fields.next().unwrap_or_default();
        if record_path.is_empty() {
            return Err(FirebakError::MalformedRecord {
                path: path.to_path_buf(),
                line,
                reason: "empty path".to_string(),
            });
        }
        records.push(FlatRecord {
            path: record_path,
            value: Scalar::infer(&value),
        });
    }
    Ok(records)
}

fn header_dialect(raw: &StringRecord) -> Option<CsvDialect> {
    if raw.len() != 2 || raw.get(0) != Some("path") {
        return None;
    }
    match raw.get(1) {
        Some("value") => Some(CsvDialect::Shard),
        Some(field) if field.trim() == "\"value\"" => Some(CsvDialect::Traversal),
        _ => None,
    }
}

/// True when `row` is exactly the quoted, escaped encoding of `raw`.
fn is_escaped_row(raw: &StringRecord, row: &str) -> bool {
    let encoded = raw
        .iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",");
    row.trim_end_matches(['\r', '\n']) == encoded
}

fn read_error(path: &Path, err: csv::Error) -> FirebakError {
    if matches!(err.kind(), csv::ErrorKind::Io(_)) {
        return FirebakError::file_io("failed to read", path, io::Error::from(err));
    }
    FirebakError::MalformedRecord {
        path: path.to_path_buf(),
        line: err.position().map(|p| p.line()).unwrap_or_default(),
        reason: err.to_string(),
    }
}

/// Unescaped spaced rows arrive as ` "value"` because the quote is not at
/// the start of the field. Strip the whitespace and the quotes.
fn legacy_unquote(field: &str) -> String {
    if !field.starts_with(char::is_whitespace) {
        return field.to_string();
    }
    let trimmed = field.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(trimmed)
        .to_string()
}
