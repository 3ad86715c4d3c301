//! `firebak restore`: replay backup files into the database.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Args;
use dialoguer::Confirm;
use futures_util::future::join_all;
use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::Value;

use crate::args::BaseArgs;
use crate::backup::RULES_FILE;
use crate::config;
use crate::error::{FirebakError, Result};
use crate::remote::Remote;
use crate::rules::parse_rules_document;
use crate::session::connect;
use crate::store::{read_records, FlatRecord};
use crate::ui::{is_interactive, key_value_table, print_command_status, spinner_bar, CommandStatus};
use crate::utils::{format_duration_secs, pluralize};

/// Writes issued concurrently before waiting for the batch to settle.
pub const RESTORE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Args)]
pub struct RestoreArgs {
    /// Collections to restore, named like their files without `.csv`
    #[arg(value_name = "COLLECTIONS")]
    collections: Vec<String>,

    /// Backup directory to restore from
    #[arg(short = 's', long)]
    source: Option<PathBuf>,

    /// Restore every collection file found in the source
    #[arg(short = 'a', long)]
    all: bool,

    /// Restore the security rules from rules.json first
    #[arg(short = 'r', long)]
    rules: bool,

    /// Replace values that already exist
    #[arg(short = 'o', long)]
    overwrite: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    Overwrite,
    SetIfAbsent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written,
    /// The path already held this value and was left alone.
    Kept(Value),
}

/// Writes `value` only when `path` currently reads as null.
///
/// The read and the write are separate requests, so two concurrent callers
/// can both see null and both write.
pub async fn set_if_absent<R: Remote>(remote: &R, path: &str, value: &Value) -> Result<WriteOutcome> {
    let existing = remote.get(path).await?;
    if !existing.is_null() {
        return Ok(WriteOutcome::Kept(existing));
    }
    remote.set(path, value).await?;
    Ok(WriteOutcome::Written)
}

pub async fn apply_record<R: Remote>(
    remote: &R,
    record: &FlatRecord,
    policy: OverwritePolicy,
) -> Result<WriteOutcome> {
    let value = Value::from(record.value.clone());
    match policy {
        OverwritePolicy::Overwrite => {
            remote.set(&record.path, &value).await?;
            Ok(WriteOutcome::Written)
        }
        OverwritePolicy::SetIfAbsent => set_if_absent(remote, &record.path, &value).await,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub file: PathBuf,
    pub records: usize,
    pub written: usize,
    pub kept: usize,
    pub batches: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCollection {
    pub collection: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub source: PathBuf,
    pub rules_restored: bool,
    pub collections: Vec<CollectionReport>,
    pub failed: Vec<FailedCollection>,
}

pub struct RestoreOrchestrator<'a, R> {
    remote: &'a R,
    source: PathBuf,
    policy: OverwritePolicy,
}

impl<'a, R: Remote> RestoreOrchestrator<'a, R> {
    pub fn new(remote: &'a R, source: impl Into<PathBuf>, policy: OverwritePolicy) -> Self {
        Self {
            remote,
            source: source.into(),
            policy,
        }
    }

    /// Restores the named collections, plus every file in the source with
    /// `all`. The session is closed before returning, on success or failure.
    ///
    /// A collection whose file cannot be read is recorded in
    /// [`RestoreReport::failed`] and the run moves on. Any other error stops
    /// the run.
    pub async fn run<F>(
        &self,
        collections: &[String],
        all: bool,
        restore_rules: bool,
        pb: &ProgressBar,
        on_collection: F,
    ) -> anyhow::Result<RestoreReport>
    where
        F: FnMut(&CollectionReport),
    {
        if !self.source.is_dir() {
            return Err(FirebakError::file_io(
                "backup source not found:",
                &self.source,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
            .into());
        }

        self.remote
            .authenticate()
            .await
            .context("failed to authenticate with the database")?;

        let result = self
            .restore_all(collections, all, restore_rules, pb, on_collection)
            .await;
        let closed = self.remote.close().await;
        let report = result?;
        closed.context("failed to close the database session")?;
        Ok(report)
    }

    async fn restore_all<F>(
        &self,
        collections: &[String],
        all: bool,
        restore_rules: bool,
        pb: &ProgressBar,
        mut on_collection: F,
    ) -> anyhow::Result<RestoreReport>
    where
        F: FnMut(&CollectionReport),
    {
        let mut report = RestoreReport {
            source: self.source.clone(),
            ..RestoreReport::default()
        };

        if restore_rules {
            pb.set_message("restoring rules");
            self.restore_rules()
                .await
                .context("failed to restore security rules")?;
            report.rules_restored = true;
        }

        let names = self.collection_names(collections, all)?;
        tracing::info!(collections = names.len(), policy = ?self.policy, "restore planned");

        for name in names {
            pb.set_prefix(name.clone());
            let file = self.source.join(format!("{name}.csv"));
            match self.restore_collection(&name, &file, pb).await {
                Ok(collection) => {
                    on_collection(&collection);
                    report.collections.push(collection);
                }
                Err(err @ FirebakError::FileIo { .. }) => {
                    tracing::warn!(collection = %name, error = %err, "skipping collection");
                    report.failed.push(FailedCollection {
                        collection: name,
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!("restore of '{name}' failed")))
                }
            }
        }
        Ok(report)
    }

    /// Pushes `rules.json` from the source back to the database.
    pub async fn restore_rules(&self) -> Result<()> {
        let path = self.source.join(RULES_FILE);
        let text = fs::read_to_string(&path)
            .map_err(|err| FirebakError::file_io("failed to read", &path, err))?;
        parse_rules_document(&text)?;
        self.remote.set_rules(&text).await?;
        tracing::info!(file = %path.display(), "rules restored");
        Ok(())
    }

    /// Explicit names first, then with `all` every `*.csv` below the source.
    pub fn collection_names(&self, collections: &[String], all: bool) -> anyhow::Result<Vec<String>> {
        let mut names: BTreeSet<String> = collections
            .iter()
            .map(|c| c.trim_matches('/').trim_end_matches(".csv").to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if all {
            names.extend(discover_collections(&self.source)?);
        }
        Ok(names.into_iter().collect())
    }

    /// Reads one backup file and writes it in batches of [`RESTORE_BATCH_SIZE`].
    ///
    /// Writes inside a batch run concurrently. A batch with any failed write
    /// ends the collection with [`FirebakError::PartialWrite`]; earlier
    /// batches stay applied.
    pub async fn restore_collection(
        &self,
        name: &str,
        file: &Path,
        pb: &ProgressBar,
    ) -> Result<CollectionReport> {
        let started = Instant::now();
        let records = read_records(file)?;
        let mut report = CollectionReport {
            collection: name.to_string(),
            file: file.to_path_buf(),
            records: records.len(),
            ..CollectionReport::default()
        };

        for (index, batch) in records.chunks(RESTORE_BATCH_SIZE).enumerate() {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|record| apply_record(self.remote, record, self.policy)),
            )
            .await;

            let mut failed = 0;
            let mut first_error = None;
            for outcome in outcomes {
                match outcome {
                    Ok(WriteOutcome::Written) => report.written += 1,
                    Ok(WriteOutcome::Kept(_)) => report.kept += 1,
                    Err(err) => {
                        failed += 1;
                        first_error.get_or_insert_with(|| err.to_string());
                    }
                }
            }
            if let Some(first_error) = first_error {
                return Err(FirebakError::PartialWrite {
                    batch: index + 1,
                    attempted: batch.len(),
                    failed,
                    first_error,
                });
            }

            report.batches += 1;
            pb.set_message(format!(
                "{} of {} {}",
                report.written + report.kept,
                report.records,
                pluralize(report.records, "record", None)
            ));
        }

        report.elapsed_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            collection = name,
            written = report.written,
            kept = report.kept,
            batches = report.batches,
            "collection restored"
        );
        Ok(report)
    }
}

/// Collection names for every `*.csv` below `source`, as paths relative to it.
fn discover_collections(source: &Path) -> anyhow::Result<Vec<String>> {
    let source = source
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", source.display()))?;
    let root = source
        .to_str()
        .with_context(|| format!("source path is not valid UTF-8: {}", source.display()))?;
    let pattern = format!("{}/**/*.csv", glob::Pattern::escape(root));

    let mut names = Vec::new();
    for entry in glob::glob(&pattern).context("invalid source pattern")? {
        let path = entry.context("failed to list backup files")?;
        let Ok(relative) = path.strip_prefix(&source) else {
            continue;
        };
        let name = relative
            .with_extension("")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if !name.is_empty() {
            names.push(name);
        }
    }
    Ok(names)
}

fn confirm_restore(args: &RestoreArgs, source: &Path) -> anyhow::Result<bool> {
    if args.yes || !(args.overwrite || args.rules) || !is_interactive() {
        return Ok(true);
    }
    let mut actions = Vec::new();
    if args.rules {
        actions.push("replace the security rules");
    }
    if args.overwrite {
        actions.push("overwrite existing values");
    }
    let prompt = format!(
        "Restore from {} will {}. Continue?",
        source.display(),
        actions.join(" and ")
    );
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

pub async fn run(base: BaseArgs, args: RestoreArgs) -> anyhow::Result<()> {
    let config = config::load();
    let Some(source) = args.source.clone().or(config.source.clone()) else {
        bail!("no backup source: pass --source or set \"source\" in firebak.json");
    };
    if !source.is_dir() {
        bail!("backup source {} does not exist", source.display());
    }
    if args.collections.is_empty() && !args.all {
        bail!("nothing to restore: name one or more collections or pass --all");
    }

    let client = connect(&base, &config)?;
    if !confirm_restore(&args, &source)? {
        print_command_status(CommandStatus::Warning, "Restore cancelled");
        return Ok(());
    }

    let policy = if args.overwrite {
        OverwritePolicy::Overwrite
    } else {
        OverwritePolicy::SetIfAbsent
    };

    if !base.json {
        print_command_status(CommandStatus::Info, "Firebak: Restore");
        println!(
            "{}",
            key_value_table([
                ("database", client.base_url().to_string()),
                ("source", source.display().to_string()),
                ("overwrite", args.overwrite.to_string()),
            ])
        );
    }

    let orchestrator = RestoreOrchestrator::new(&client, &source, policy);
    let pb = spinner_bar("Restoring");
    let json = base.json;
    let report = orchestrator
        .run(&args.collections, args.all, args.rules, &pb, |collection| {
            if json {
                return;
            }
            pb.suspend(|| {
                print_command_status(
                    CommandStatus::Success,
                    &format!("Restored {}", collection.collection),
                );
                let table = key_value_table([
                    ("file", collection.file.display().to_string()),
                    ("records", collection.records.to_string()),
                    ("written", collection.written.to_string()),
                    ("kept", collection.kept.to_string()),
                    ("duration", format_duration_secs(collection.elapsed_seconds)),
                ]);
                println!("{table}\n");
            });
        })
        .await;
    pb.finish_and_clear();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if report.rules_restored {
            print_command_status(CommandStatus::Success, "Security rules restored");
        }
        for failed in &report.failed {
            print_command_status(
                CommandStatus::Error,
                &format!("{}: {}", failed.collection, failed.error),
            );
        }
    }

    if !report.failed.is_empty() {
        let count = report.failed.len();
        bail!(
            "{count} {} could not be restored",
            pluralize(count, "collection", None)
        );
    }
    if !json {
        let count = report.collections.len();
        print_command_status(
            CommandStatus::Success,
            &format!("Restore complete: {count} {}", pluralize(count, "collection", None)),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backup::BackupOrchestrator;
    use crate::remote::memory::MemoryRemote;
    use crate::rules::BackupTarget;

    fn write_backup(dir: &Path, name: &str, body: &str) {
        let file = dir.join(format!("{name}.csv"));
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, format!("\"path\",\"value\"\n{body}")).unwrap();
    }

    fn sorted_writes(remote: &MemoryRemote) -> Vec<(String, Value)> {
        let mut writes = remote.writes();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        writes
    }

    #[tokio::test]
    async fn backup_then_restore_with_overwrite_replays_every_leaf() {
        let live = MemoryRemote::new(json!({"root": {"a": {"b": 1, "c": "x"}, "d": 2}}));
        let dir = tempfile::tempdir().unwrap();
        BackupOrchestrator::new(&live, dir.path(), "firebak")
            .export_target(&BackupTarget::new("root", 2).unwrap(), &ProgressBar::hidden())
            .await
            .unwrap();

        let fresh = MemoryRemote::new(json!({}));
        let report = RestoreOrchestrator::new(&fresh, dir.path(), OverwritePolicy::Overwrite)
            .run(&["root".to_string()], false, false, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.collections[0].written, 3);
        assert_eq!(
            sorted_writes(&fresh),
            vec![
                ("root/a/b".to_string(), json!(1)),
                ("root/a/c".to_string(), json!("x")),
                ("root/d".to_string(), json!(2)),
            ]
        );
        assert_eq!(fresh.value_at("root"), json!({"a": {"b": 1, "c": "x"}, "d": 2}));
        assert!(fresh.is_closed());
    }

    #[tokio::test]
    async fn set_if_absent_keeps_existing_values() {
        let remote = MemoryRemote::new(json!({"users": {"u1": "Ann"}}));

        let outcome = set_if_absent(&remote, "users/u1", &json!("Bo")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Kept(json!("Ann")));
        assert!(remote.writes().is_empty());

        let outcome = set_if_absent(&remote, "users/u2", &json!("Cy")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(remote.writes(), vec![("users/u2".to_string(), json!("Cy"))]);
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_writes_at_least_once() {
        let remote = MemoryRemote::new(json!({}));
        let (one, two) = (json!(1), json!(2));
        let (first, second) = tokio::join!(
            set_if_absent(&remote, "slot", &one),
            set_if_absent(&remote, "slot", &two),
        );
        first.unwrap();
        second.unwrap();

        let writes = remote.writes().len();
        assert!((1..=2).contains(&writes));
        assert!(!remote.value_at("slot").is_null());
    }

    #[tokio::test]
    async fn failed_write_in_a_batch_is_a_partial_write() {
        let remote = MemoryRemote::new(json!({}));
        remote.fail_writes_under("locked/");
        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), "mixed", "\"locked/a\",\"1\"\n\"open/b\",\"2\"\n");

        let err = RestoreOrchestrator::new(&remote, dir.path(), OverwritePolicy::Overwrite)
            .restore_collection("mixed", &dir.path().join("mixed.csv"), &ProgressBar::hidden())
            .await
            .unwrap_err();

        match err {
            FirebakError::PartialWrite {
                batch,
                attempted,
                failed,
                ..
            } => {
                assert_eq!((batch, attempted, failed), (1, 2, 1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(remote.value_at("open/b"), json!(2));
    }

    #[tokio::test]
    async fn batches_are_capped_at_the_batch_size() {
        let remote = MemoryRemote::new(json!({}));
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..250).map(|i| format!("\"items/k{i:03}\",\"{i}\"\n")).collect();
        write_backup(dir.path(), "items", &body);

        let report = RestoreOrchestrator::new(&remote, dir.path(), OverwritePolicy::SetIfAbsent)
            .restore_collection("items", &dir.path().join("items.csv"), &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.written, 250);
        assert_eq!(remote.value_at("items/k249"), json!(249));
    }

    #[tokio::test]
    async fn missing_collection_file_does_not_stop_the_others() {
        let remote = MemoryRemote::new(json!({}));
        let dir = tempfile::tempdir().unwrap();
        write_backup(dir.path(), "present", "\"present/a\",\"true\"\n");

        let report = RestoreOrchestrator::new(&remote, dir.path(), OverwritePolicy::SetIfAbsent)
            .run(
                &["missing".to_string(), "present".to_string()],
                false,
                false,
                &ProgressBar::hidden(),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].collection, "missing");
        assert_eq!(report.collections.len(), 1);
        assert_eq!(remote.value_at("present/a"), json!(true));
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn missing_source_fails_before_authenticating() {
        let remote = MemoryRemote::new(json!({}));
        let dir = tempfile::tempdir().unwrap();
        let err = RestoreOrchestrator::new(&remote, dir.path().join("nope"), OverwritePolicy::Overwrite)
            .run(&[], true, false, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FirebakError>(),
            Some(FirebakError::FileIo { .. })
        ));
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn restores_rules_and_discovers_nested_collections() {
        let remote = MemoryRemote::new(json!({}));
        let dir = tempfile::tempdir().unwrap();
        let rules = "{\n  \"rules\": {\n    \".read\": true\n  }\n}\n";
        fs::write(dir.path().join(RULES_FILE), rules).unwrap();
        write_backup(dir.path(), "users", "\"users/u1/age\",\"30\"\n");
        write_backup(&dir.path().join("org"), "teams", "\"org/teams/t1\",\"core\"\n");

        let orchestrator = RestoreOrchestrator::new(&remote, dir.path(), OverwritePolicy::SetIfAbsent);
        assert_eq!(
            orchestrator.collection_names(&[], true).unwrap(),
            vec!["org/teams".to_string(), "users".to_string()]
        );

        let report = orchestrator
            .run(&[], true, true, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap();

        assert!(report.rules_restored);
        assert_eq!(remote.rules(), rules);
        assert_eq!(report.collections.len(), 2);
        assert_eq!(remote.value_at("users/u1/age"), json!(30));
        assert_eq!(remote.value_at("org/teams/t1"), json!("core"));
    }
}
