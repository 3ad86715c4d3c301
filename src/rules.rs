//! Discovery of backup targets from annotations in the security rules.
//!
//! A rules document marks a subtree for backup with a key such as
//! `"firebak:shard:20": true` placed inside that subtree's rules. The number
//! is the page size used when exporting the subtree.

use serde_json::{Map, Value};

use crate::error::{FirebakError, Result};
use crate::tree::join_path;

pub const DEFAULT_MARKER: &str = "firebak";

const SHARD_DIRECTIVE: &str = "shard";

/// A subtree to export and the page size used to walk its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub path: String,
    pub shard_size: usize,
    /// The annotation key this target came from, e.g. `firebak:shard:20`.
    pub rule: String,
}

impl BackupTarget {
    #[cfg(test)]
    pub fn new(path: impl Into<String>, shard_size: usize) -> Result<Self> {
        let path = path.into();
        let rule = format!("{SHARD_DIRECTIVE}:{shard_size}");
        Self::with_rule(path, shard_size, rule)
    }

    /// Page sizes below 2 cannot advance an inclusive cursor and are rejected.
    fn with_rule(path: String, shard_size: usize, rule: String) -> Result<Self> {
        if shard_size < 2 {
            return Err(FirebakError::InvalidShardDirective {
                path,
                directive: rule,
                reason: format!("shard size must be at least 2, got {shard_size}"),
            });
        }
        Ok(Self {
            path,
            shard_size,
            rule,
        })
    }

    /// File stem used for this target in a backup directory.
    pub fn file_stem(&self) -> &str {
        if self.path.is_empty() {
            "root"
        } else {
            &self.path
        }
    }
}

/// Removes `//` and `/* */` comments, leaving string literals untouched.
///
/// Block comments may span lines; the newlines inside them are kept so line
/// numbers in parse errors still match the source.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            match ch {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (ch, chars.peek().copied()) {
            ('"', _) => {
                in_string = true;
                out.push(ch);
            }
            ('/', Some('/')) => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if inner == '/' && prev == '*' {
                        break;
                    }
                    if inner == '\n' {
                        out.push('\n');
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Parses a rules document, tolerating comments.
pub fn parse_rules_document(text: &str) -> Result<Value> {
    serde_json::from_str(&strip_comments(text)).map_err(FirebakError::MalformedRules)
}

/// Finds every annotated subtree in rules text.
#[cfg(test)]
pub fn parse_annotations(text: &str, marker: &str) -> Result<Vec<BackupTarget>> {
    let document = parse_rules_document(text)?;
    annotations_from_document(&document, marker)
}

/// Finds every annotated subtree in a decoded rules document.
pub fn annotations_from_document(document: &Value, marker: &str) -> Result<Vec<BackupTarget>> {
    let rules = document.get("rules").unwrap_or(document);
    let mut hits = Vec::new();
    if let Value::Object(map) = rules {
        let prefix = format!("{marker}:");
        collect_annotation_paths(map, "", &prefix, &mut hits);
    }
    tracing::debug!(count = hits.len(), marker, "found backup annotations");

    hits.iter()
        .map(|hit| target_from_hit(hit, marker))
        .collect()
}

fn collect_annotation_paths(map: &Map<String, Value>, path: &str, prefix: &str, hits: &mut Vec<String>) {
    for (key, child) in map {
        let child_path = format!("{path}/{key}");
        if key.starts_with(prefix) {
            hits.push(child_path);
            continue;
        }
        if let Value::Object(inner) = child {
            collect_annotation_paths(inner, &child_path, prefix, hits);
        }
    }
}

fn target_from_hit(hit: &str, marker: &str) -> Result<BackupTarget> {
    let mut segments: Vec<&str> = hit.split('/').filter(|s| !s.is_empty()).collect();
    let directive = segments.pop().unwrap_or_default().to_string();
    let path = segments
        .iter()
        .fold(String::new(), |acc, segment| join_path(&acc, segment));

    let invalid = |reason: String| FirebakError::InvalidShardDirective {
        path: path.clone(),
        directive: directive.clone(),
        reason,
    };

    let body = directive
        .strip_prefix(marker)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| invalid(format!("expected '{marker}:{SHARD_DIRECTIVE}:<N>'")))?;
    let (kind, size) = body
        .split_once(':')
        .ok_or_else(|| invalid(format!("expected '{marker}:{SHARD_DIRECTIVE}:<N>'")))?;
    if kind != SHARD_DIRECTIVE {
        return Err(invalid(format!("unknown directive '{kind}'")));
    }
    let shard_size = size
        .trim()
        .parse::<usize>()
        .map_err(|_| invalid(format!("'{size}' is not a page size")))?;

    BackupTarget::with_rule(path.clone(), shard_size, directive.clone())
}
