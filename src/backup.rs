//! `firebak backup`: export annotated subtrees to CSV files.
//!
//! A run reads the security rules, saves them to `rules.json`, then exports
//! each target one at a time. Annotated targets are paginated in shards;
//! collections without an annotation are walked node by node.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::Local;
use clap::Args;
use indicatif::ProgressBar;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::config;
use crate::error::{FirebakError, Result};
use crate::paginate::ShardedPaginator;
use crate::remote::Remote;
use crate::rules::{annotations_from_document, parse_rules_document, BackupTarget, DEFAULT_MARKER};
use crate::session::connect;
use crate::store::{CsvDialect, RecordStore};
use crate::tree::{flatten_value, join_path, Node};
use crate::ui::{key_value_table, print_command_status, spinner_bar, stats_table, CommandStatus};
use crate::utils::pluralize;

pub const RULES_FILE: &str = "rules.json";

#[derive(Debug, Clone, Args)]
pub struct BackupArgs {
    /// Paths to back up. Defaults to every annotated path in the rules.
    #[arg(value_name = "COLLECTIONS")]
    collections: Vec<String>,

    /// Destination directory [default: ./backups/YYYY.MM.DD.HH]
    #[arg(short = 'd', long)]
    destination: Option<PathBuf>,

    /// Also back up top-level collections that have no backup annotation
    #[arg(short = 'a', long)]
    all: bool,

    /// Annotation marker to look for in the rules [default: firebak]
    #[arg(long)]
    marker: Option<String>,
}

/// Request statistics for one target, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExportStats {
    pub max_request_size: usize,
    pub total_request_size: usize,
    pub total_object_count: usize,
    pub elapsed_seconds: f64,
}

impl ExportStats {
    pub fn record_request(&mut self, bytes: usize) {
        self.max_request_size = self.max_request_size.max(bytes);
        self.total_request_size += bytes;
    }

    pub fn merge(&mut self, other: &ExportStats) {
        self.max_request_size = self.max_request_size.max(other.max_request_size);
        self.total_request_size += other.total_request_size;
        self.total_object_count += other.total_object_count;
        self.elapsed_seconds += other.elapsed_seconds;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportJob {
    Sharded(BackupTarget),
    Traversal(String),
}

impl ExportJob {
    pub fn name(&self) -> &str {
        match self {
            ExportJob::Sharded(target) => target.file_stem(),
            ExportJob::Traversal(path) => path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub path: String,
    pub file: PathBuf,
    pub rule: String,
    pub rows: usize,
    #[serde(flatten)]
    pub stats: ExportStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub destination: PathBuf,
    pub rules_file: PathBuf,
    pub targets: Vec<TargetReport>,
    pub totals: ExportStats,
}

pub struct BackupOrchestrator<'a, R> {
    remote: &'a R,
    destination: PathBuf,
    marker: String,
}

impl<'a, R: Remote> BackupOrchestrator<'a, R> {
    pub fn new(remote: &'a R, destination: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            remote,
            destination: destination.into(),
            marker: marker.into(),
        }
    }

    /// Runs a full backup. `on_target` sees each report as its target finishes.
    pub async fn run<F>(
        &self,
        collections: &[String],
        all: bool,
        pb: &ProgressBar,
        mut on_target: F,
    ) -> anyhow::Result<BackupReport>
    where
        F: FnMut(&TargetReport),
    {
        fs::create_dir_all(&self.destination)
            .map_err(|err| FirebakError::file_io("failed to create", &self.destination, err))?;

        pb.set_message("reading rules");
        let targets = self
            .backup_rules()
            .await
            .context("failed to back up security rules")?;

        let top_level = if all {
            pb.set_message("listing collections");
            self.top_level_collections()
                .await
                .context("failed to list top-level collections")?
        } else {
            Vec::new()
        };
        let jobs = plan_jobs(&targets, collections, &top_level);
        tracing::info!(jobs = jobs.len(), "backup planned");

        let mut reports = Vec::with_capacity(jobs.len());
        let mut totals = ExportStats::default();
        for job in &jobs {
            pb.set_prefix(job.name().to_string());
            let report = match job {
                ExportJob::Sharded(target) => self.export_target(target, pb).await,
                ExportJob::Traversal(path) => self.export_traversal(path, pb).await,
            }
            .with_context(|| format!("backup of '{}' failed", job.name()))?;
            totals.merge(&report.stats);
            on_target(&report);
            reports.push(report);
        }

        Ok(BackupReport {
            destination: self.destination.clone(),
            rules_file: self.destination.join(RULES_FILE),
            targets: reports,
            totals,
        })
    }

    /// Returns the annotated targets after saving the rules, pretty-printed
    /// without comments, to `rules.json`. Nothing is written if the rules are
    /// invalid.
    pub async fn backup_rules(&self) -> Result<Vec<BackupTarget>> {
        let text = self.remote.get_rules().await?;
        let document = parse_rules_document(&text)?;
        let targets = annotations_from_document(&document, &self.marker)?;

        let path = self.destination.join(RULES_FILE);
        let pretty = serde_json::to_string_pretty(&document).map_err(FirebakError::MalformedRules)?;
        fs::write(&path, pretty)
            .map_err(|err| FirebakError::file_io("failed to write", &path, err))?;
        Ok(targets)
    }

    async fn top_level_collections(&self) -> Result<Vec<String>> {
        let root = self.remote.get_shallow("").await?;
        Ok(match root {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Pages through the target's children and streams them to its CSV file.
    pub async fn export_target(&self, target: &BackupTarget, pb: &ProgressBar) -> Result<TargetReport> {
        let started = Instant::now();
        let file = self.output_file(target.file_stem())?;
        let mut store = RecordStore::create(&file, CsvDialect::Shard)?;
        let mut stats = ExportStats::default();
        let mut paginator = ShardedPaginator::new(self.remote, target);

        while let Some(page) = paginator.next_page().await? {
            stats.record_request(page.bytes);
            stats.total_object_count += page.entries.len();
            for (key, child) in &page.entries {
                store.extend(flatten_value(child, &join_path(&target.path, key)));
            }
            store.flush_if_full()?;
            pb.set_message(format!(
                "{} {}, {} rows written, {} {}",
                stats.total_object_count,
                pluralize(stats.total_object_count, "object", None),
                store.rows_written(),
                paginator.requests(),
                pluralize(paginator.requests(), "request", None)
            ));
        }

        let rows = store.close()?;
        stats.elapsed_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            path = %target.path,
            rows,
            objects = stats.total_object_count,
            requests = paginator.requests(),
            last_cursor = %paginator.cursor().start_at,
            "target exported"
        );
        Ok(TargetReport {
            path: target.path.clone(),
            file,
            rule: target.rule.clone(),
            rows,
            stats,
        })
    }

    /// Walks a collection with shallow reads, one node per request.
    pub async fn export_traversal(&self, collection: &str, pb: &ProgressBar) -> Result<TargetReport> {
        let started = Instant::now();
        let collection = collection.trim_matches('/');
        let file = self.output_file(collection)?;
        let mut store = RecordStore::create(&file, CsvDialect::Traversal)?;
        let mut stats = ExportStats::default();
        let mut requests = 0usize;
        let mut queue = VecDeque::from([collection.to_string()]);

        while let Some(path) = queue.pop_front() {
            let value = self.remote.get_shallow(&path).await?;
            requests += 1;
            stats.record_request(value.to_string().len());

            match Node::from_json(&value) {
                None => {}
                Some(Node::Scalar(scalar)) => store.extend([(path.clone(), scalar)]),
                Some(Node::Branch(children)) => {
                    if path == collection {
                        stats.total_object_count = children.len();
                    }
                    queue.extend(children.keys().map(|key| join_path(&path, key)));
                }
            }
            store.flush_if_full()?;
            pb.set_message(format!(
                "{} {} visited, {} queued",
                requests,
                pluralize(requests, "node", None),
                queue.len()
            ));
        }

        let rows = store.close()?;
        stats.elapsed_seconds = started.elapsed().as_secs_f64();
        tracing::info!(path = collection, rows, requests, "collection traversed");
        Ok(TargetReport {
            path: collection.to_string(),
            file,
            rule: "traversal".to_string(),
            rows,
            stats,
        })
    }

    /// `<destination>/<stem>.csv`, creating directories for nested stems.
    fn output_file(&self, stem: &str) -> Result<PathBuf> {
        let file = self.destination.join(format!("{stem}.csv"));
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| FirebakError::file_io("failed to create", parent, err))?;
        }
        Ok(file)
    }
}

/// Annotated targets first, in rules order, then traversals.
///
/// Explicit collections keep only targets with the same path; a collection
/// with no such target is traversed instead. Top-level collections listed
/// by `--all` are traversed unless a target already covers them. A root
/// target covers everything, but only when no collection filter excludes it.
pub fn plan_jobs(targets: &[BackupTarget], collections: &[String], top_level: &[String]) -> Vec<ExportJob> {
    let wanted: BTreeSet<&str> = collections
        .iter()
        .map(|c| c.trim_matches('/'))
        .filter(|c| !c.is_empty())
        .collect();

    let mut jobs: Vec<ExportJob> = targets
        .iter()
        .filter(|t| wanted.is_empty() || wanted.contains(t.path.as_str()))
        .cloned()
        .map(ExportJob::Sharded)
        .collect();

    // A root target only covers other collections when it is itself exported.
    let root_exported = jobs
        .iter()
        .any(|job| matches!(job, ExportJob::Sharded(t) if t.path.is_empty()));
    let is_target = |name: &str| root_exported || targets.iter().any(|t| t.path == name);
    let traversals: BTreeSet<&str> = wanted
        .iter()
        .copied()
        .chain(top_level.iter().map(String::as_str))
        .filter(|name| !is_target(*name))
        .collect();
    jobs.extend(traversals.into_iter().map(|name| ExportJob::Traversal(name.to_string())));
    jobs
}

fn default_destination() -> PathBuf {
    PathBuf::from(format!("./backups/{}", Local::now().format("%Y.%m.%d.%H")))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(path))
}

pub async fn run(base: BaseArgs, args: BackupArgs) -> anyhow::Result<()> {
    let config = config::load();
    let client = connect(&base, &config)?;
    let destination = args
        .destination
        .or(config.destination)
        .unwrap_or_else(default_destination);
    let destination = absolute(&destination)?;
    let marker = args
        .marker
        .or(config.marker)
        .unwrap_or_else(|| DEFAULT_MARKER.to_string());

    if !base.json {
        print_command_status(CommandStatus::Info, "Firebak: Backup");
        println!(
            "{}",
            key_value_table([
                ("date/time", Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
                ("database", client.base_url().to_string()),
                ("destination", destination.display().to_string()),
            ])
        );
    }

    let orchestrator = BackupOrchestrator::new(&client, &destination, &marker);
    let pb = spinner_bar("Backing up");
    let json = base.json;
    let report = orchestrator
        .run(&args.collections, args.all, &pb, |report| {
            if json {
                return;
            }
            pb.suspend(|| {
                print_command_status(
                    CommandStatus::Success,
                    &format!("Backup complete: {}", display_path(&report.path)),
                );
                let table = stats_table(
                    vec![
                        ("file", report.file.display().to_string()),
                        ("rule", report.rule.clone()),
                        ("rows", report.rows.to_string()),
                    ],
                    &report.stats,
                );
                println!("{table}\n");
            });
        })
        .await;
    pb.finish_and_clear();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.targets.is_empty() {
        print_command_status(
            CommandStatus::Warning,
            &format!(
                "nothing to back up: no '{marker}:shard:<N>' annotations matched; rules saved to {}",
                report.rules_file.display()
            ),
        );
        return Ok(());
    }

    let count = report.targets.len();
    print_command_status(
        CommandStatus::Success,
        &format!(
            "Backup complete: {count} {}",
            pluralize(count, "collection", None)
        ),
    );
    println!(
        "{}",
        stats_table(
            vec![("destination", report.destination.display().to_string())],
            &report.totals,
        )
    );
    Ok(())
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::remote::memory::MemoryRemote;

    fn remote_with_rules(tree: serde_json::Value, rules: &str) -> MemoryRemote {
        MemoryRemote::new(tree).with_rules(rules)
    }

    #[tokio::test]
    async fn exports_a_sharded_target_to_csv() {
        let remote = MemoryRemote::new(json!({"root": {"a": {"b": 1, "c": "x"}, "d": 2}}));
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = BackupOrchestrator::new(&remote, dir.path(), "firebak");
        let target = BackupTarget::new("root", 2).unwrap();

        let report = orchestrator
            .export_target(&target, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(report.stats.total_object_count, 2);
        assert_eq!(remote.page_requests(), 2);
        assert!(report.stats.max_request_size > 0);
        assert!(report.stats.total_request_size >= report.stats.max_request_size);
        assert_eq!(
            fs::read_to_string(dir.path().join("root.csv")).unwrap(),
            "\"path\",\"value\"\n\"root/a/b\",\"1\"\n\"root/a/c\",\"x\"\n\"root/d\",\"2\"\n"
        );
    }

    #[tokio::test]
    async fn run_saves_rules_and_one_file_per_target() {
        let rules = r#"{
          // exported nightly
          "rules": {
            "users": { "firebak:shard:3": true, ".read": "auth != null" },
            "org": { "teams": { "firebak:shard:2": true } }
          }
        }"#;
        let tree = json!({
            "users": {"u1": {"name": "Ann"}, "u2": {"name": "Bo"}, "u3": {"name": "Cy"}, "u4": {"name": "Di"}},
            "org": {"teams": {"t1": {"size": 3}}}
        });
        let remote = remote_with_rules(tree, rules);
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("backups").join("2024.01.02.03");
        let orchestrator = BackupOrchestrator::new(&remote, &destination, "firebak");

        let mut seen = Vec::new();
        let report = orchestrator
            .run(&[], false, &ProgressBar::hidden(), |r| seen.push(r.path.clone()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["org/teams".to_string(), "users".to_string()]);
        assert_eq!(report.targets.len(), 2);
        assert_eq!(report.totals.total_object_count, 5);
        assert_eq!(
            report.totals.total_request_size,
            report.targets.iter().map(|t| t.stats.total_request_size).sum::<usize>()
        );

        let saved = fs::read_to_string(destination.join(RULES_FILE)).unwrap();
        assert!(!saved.contains("exported nightly"));
        assert!(saved.contains("\n  \"rules\": {\n"), "{saved}");
        let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
        assert_eq!(saved, parse_rules_document(rules).unwrap());

        let users = fs::read_to_string(destination.join("users.csv")).unwrap();
        assert_eq!(users.lines().count(), 5);
        assert!(destination.join("org").join("teams.csv").is_file());
    }

    #[tokio::test]
    async fn shard_size_of_one_fails_before_any_page_request() {
        let remote = remote_with_rules(
            json!({"logs": {"a": 1, "b": 2}}),
            r#"{"rules": {"logs": {"firebak:shard:1": true}}}"#,
        );
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = BackupOrchestrator::new(&remote, dir.path(), "firebak");

        let err = orchestrator
            .run(&[], false, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FirebakError>(),
            Some(FirebakError::InvalidShardDirective { .. })
        ));
        assert_eq!(remote.page_requests(), 0);
        assert!(!dir.path().join(RULES_FILE).exists());
        assert!(!dir.path().join("logs.csv").exists());
    }

    #[tokio::test]
    async fn malformed_rules_abort_the_run() {
        let remote = remote_with_rules(json!({}), "{ \"rules\": ");
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = BackupOrchestrator::new(&remote, dir.path(), "firebak");
        let err = orchestrator
            .run(&[], false, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FirebakError>(),
            Some(FirebakError::MalformedRules(_))
        ));
    }

    #[tokio::test]
    async fn unannotated_collection_is_traversed() {
        let remote = remote_with_rules(
            json!({"rooms": {"r1": {"name": "lobby", "tags": {"a": true}}, "r2": {"name": "den"}}}),
            r#"{"rules": {"users": {"firebak:shard:10": true}}}"#,
        );
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = BackupOrchestrator::new(&remote, dir.path(), "firebak");

        let report = orchestrator
            .run(&["rooms".to_string()], false, &ProgressBar::hidden(), |_| {})
            .await
            .unwrap();

        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.targets[0].rule, "traversal");
        assert_eq!(report.targets[0].stats.total_object_count, 2);
        assert_eq!(remote.page_requests(), 0);
        let text = fs::read_to_string(dir.path().join("rooms.csv")).unwrap();
        assert!(text.starts_with("\"path\", \"value\"\n"));
        assert!(text.contains("\"rooms/r1/tags/a\",\"true\""));
        assert!(text.contains("\"rooms/r2/name\",\"den\""));
    }

    #[test]
    fn plan_filters_targets_and_adds_traversals() {
        let targets = vec![
            BackupTarget::new("users", 20).unwrap(),
            BackupTarget::new("rooms", 10).unwrap(),
        ];
        assert_eq!(plan_jobs(&targets, &[], &[]).len(), 2);

        let jobs = plan_jobs(&targets, &["rooms".to_string(), "/extra/".to_string()], &[]);
        assert_eq!(
            jobs,
            vec![
                ExportJob::Sharded(targets[1].clone()),
                ExportJob::Traversal("extra".to_string()),
            ]
        );

        let top = vec!["users".to_string(), "settings".to_string()];
        let jobs = plan_jobs(&targets, &[], &top);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2], ExportJob::Traversal("settings".to_string()));

        let root = vec![BackupTarget::new("", 5).unwrap()];
        assert_eq!(plan_jobs(&root, &[], &top).len(), 1);
    }

    #[test]
    fn filtered_out_root_target_does_not_hide_named_collections() {
        let root = vec![BackupTarget::new("", 5).unwrap()];
        assert_eq!(
            plan_jobs(&root, &["users".to_string()], &[]),
            vec![ExportJob::Traversal("users".to_string())]
        );
    }

    #[test]
    fn stats_merge_takes_max_and_sums_the_rest() {
        let mut totals = ExportStats::default();
        let mut a = ExportStats::default();
        a.record_request(100);
        a.record_request(300);
        a.total_object_count = 4;
        a.elapsed_seconds = 1.0;
        let mut b = ExportStats::default();
        b.record_request(200);
        b.total_object_count = 1;
        b.elapsed_seconds = 0.5;

        totals.merge(&a);
        totals.merge(&b);
        assert_eq!(totals.max_request_size, 300);
        assert_eq!(totals.total_request_size, 600);
        assert_eq!(totals.total_object_count, 5);
        assert_eq!(totals.elapsed_seconds, 1.5);
    }
}
