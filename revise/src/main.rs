use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use revise::core::{DocId, LadderKind, RunConfig, StageTable, TriggerMode};
use revise::orchestrator::{
    Clock, FixedClock, MemoryNotifier, Notifier, Outcome, Rescheduler, StdoutNotifier,
    SystemClock, rewrite_text,
};
use revise::storage::FsDocumentStore;
use revise::{Scope, evaluate, watch};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "revise",
    about = "Spaced-repetition rescheduling for markdown task lists",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    /// Revision ladder to apply to #revise tags.
    #[arg(long, global = true, value_enum, default_value_t = LadderArg::Cycle)]
    ladder: LadderArg,
    /// Use this date instead of today when a line has no completion date (YYYY-MM-DD).
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule follow-ups for completed tasks in the given files.
    Scan(ScanArgs),

    /// Schedule follow-ups in every document under a directory.
    ScanAll(ScanAllArgs),

    /// Watch a directory and schedule follow-ups as files change.
    Watch(WatchArgs),

    /// Evaluate a single task line and print the result.
    Next(NextArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Markdown files to process.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Print the rewritten text instead of writing it back.
    #[arg(long)]
    dry_run: bool,
    /// Emit JSON outcomes instead of notices.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ScanAllArgs {
    /// Root directory of the notes.
    dir: PathBuf,
    /// Extension of documents to scan.
    #[arg(long, default_value = "md")]
    ext: String,
    /// Emit a JSON summary instead of notices.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    /// Root directory of the notes.
    dir: PathBuf,
    /// Extension of documents to watch.
    #[arg(long, default_value = "md")]
    ext: String,
    /// What a change event triggers.
    #[arg(long, value_enum, default_value_t = TriggerArg::Save)]
    trigger: TriggerArg,
    /// Quiet period before a burst of changes is processed.
    #[arg(long, default_value_t = 300)]
    debounce_ms: u64,
    /// How long to ignore change events after writing a file.
    #[arg(long, default_value_t = 1000)]
    grace_ms: u64,
}

#[derive(Debug, Args)]
struct NextArgs {
    /// The task line, e.g. "- [x] Read chapter 3 #revise".
    #[arg(allow_hyphen_values = true)]
    line: String,
    /// Emit JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LadderArg {
    Cycle,
    Terminating,
}

impl From<LadderArg> for LadderKind {
    fn from(value: LadderArg) -> Self {
        match value {
            LadderArg::Cycle => LadderKind::Cycle,
            LadderArg::Terminating => LadderKind::Terminating,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TriggerArg {
    Save,
    Toggle,
}

impl From<TriggerArg> for TriggerMode {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Save => TriggerMode::Save,
            TriggerArg::Toggle => TriggerMode::Toggle,
        }
    }
}

/// Options shared by every command.
#[derive(Debug, Clone, Copy)]
struct Globals {
    ladder: LadderKind,
    today: Option<NaiveDate>,
}

impl Globals {
    fn clock(&self) -> Arc<dyn Clock> {
        match self.today {
            Some(date) => Arc::new(FixedClock(date)),
            None => Arc::new(SystemClock),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let globals = Globals {
        ladder: cli.ladder.into(),
        today: cli.today,
    };
    match cli.command {
        Commands::Scan(args) => handle_scan(args, globals).await,
        Commands::ScanAll(args) => handle_scan_all(args, globals).await,
        Commands::Watch(args) => handle_watch(args, globals).await,
        Commands::Next(args) => handle_next(args, globals),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn notifier(json: bool) -> Arc<dyn Notifier> {
    if json {
        Arc::new(MemoryNotifier::default())
    } else {
        Arc::new(StdoutNotifier)
    }
}

/// Split a file path into a store rooted at its directory and the document id inside it.
fn locate(path: &Path) -> Result<(PathBuf, DocId)> {
    let canonical =
        fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
    if !canonical.is_file() {
        anyhow::bail!("{:?} is not a file", canonical);
    }
    let parent = canonical
        .parent()
        .with_context(|| format!("file {:?} has no parent directory", canonical))?
        .to_path_buf();
    let name = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("file name of {:?} is not valid UTF-8", canonical))?;
    Ok((parent, DocId::new(name)))
}

async fn handle_scan(args: ScanArgs, globals: Globals) -> Result<()> {
    let ScanArgs {
        inputs,
        dry_run,
        json,
    } = args;

    if dry_run {
        let table = StageTable::for_kind(globals.ladder);
        let today = globals.clock().today();
        for path in &inputs {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            let rewrite = rewrite_text(&table, &text, today, &Scope::All);
            if inputs.len() > 1 {
                println!("== {} ({} scheduled) ==", path.display(), rewrite.scheduled);
            }
            print!("{}", rewrite.text);
            if !rewrite.text.ends_with('\n') {
                println!();
            }
        }
        return Ok(());
    }

    #[derive(serde::Serialize)]
    struct JsonOutput {
        path: String,
        #[serde(flatten)]
        outcome: Option<Outcome>,
    }

    let mut results = Vec::new();
    let mut failed = 0;
    for path in &inputs {
        let (root, doc) = locate(path)?;
        let config = RunConfig {
            ladder: globals.ladder,
            ..RunConfig::default()
        };
        let rescheduler = Rescheduler::new(
            Arc::new(FsDocumentStore::new(root)),
            globals.clock(),
            notifier(json),
            config,
        );
        let outcome = rescheduler.scan_current(&doc).await;
        if outcome.is_none() {
            failed += 1;
        }
        results.push(JsonOutput {
            path: path.display().to_string(),
            outcome,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    if failed > 0 {
        anyhow::bail!("failed to process {failed} file(s)");
    }
    Ok(())
}

async fn handle_scan_all(args: ScanAllArgs, globals: Globals) -> Result<()> {
    let ScanAllArgs { dir, ext, json } = args;
    let root = fs::canonicalize(&dir).with_context(|| format!("resolving path {:?}", dir))?;
    if !root.is_dir() {
        anyhow::bail!("{:?} is not a directory", root);
    }

    let config = RunConfig {
        ladder: globals.ladder,
        extension: ext,
        ..RunConfig::default()
    };
    let rescheduler = Rescheduler::new(
        Arc::new(FsDocumentStore::new(root)),
        globals.clock(),
        notifier(json),
        config,
    );
    let summary = rescheduler.scan_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if summary.failed > 0 {
        anyhow::bail!("failed to process {} document(s)", summary.failed);
    }
    Ok(())
}

async fn handle_watch(args: WatchArgs, globals: Globals) -> Result<()> {
    let WatchArgs {
        dir,
        ext,
        trigger,
        debounce_ms,
        grace_ms,
    } = args;
    let root = fs::canonicalize(&dir).with_context(|| format!("resolving path {:?}", dir))?;
    if !root.is_dir() {
        anyhow::bail!("{:?} is not a directory", root);
    }

    let config = RunConfig {
        ladder: globals.ladder,
        trigger: trigger.into(),
        debounce: Duration::from_millis(debounce_ms),
        self_write_grace: Duration::from_millis(grace_ms),
        extension: ext,
    };
    let rescheduler = Arc::new(Rescheduler::new(
        Arc::new(FsDocumentStore::new(&root)),
        globals.clock(),
        Arc::new(StdoutNotifier),
        config.clone(),
    ));

    if config.trigger == TriggerMode::Toggle {
        let count = rescheduler
            .baseline_all()
            .await
            .context("recording checkbox baseline")?;
        info!(documents = count, "recorded checkbox baseline");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = watch::watch_directory(&root, &config.extension, tx)
        .with_context(|| format!("watching {:?}", root))?;
    let worker = tokio::spawn(watch::run(Arc::clone(&rescheduler), rx, config.debounce));

    info!(root = %root.display(), "watching for changes; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    // Dropping the watcher closes the queue; the worker flushes and exits.
    drop(watcher);
    worker.await.context("joining watch worker")?;
    Ok(())
}

fn handle_next(args: NextArgs, globals: Globals) -> Result<()> {
    let NextArgs { line, json } = args;
    let table = StageTable::for_kind(globals.ladder);
    let result = evaluate(&table, &line, globals.clock().today());

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    match result {
        Some(next) => {
            println!("{}", next.original);
            println!("{}", next.next);
        }
        None => eprintln!("No change: the line is not a completed, unprocessed scheduling task."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn globals() -> Globals {
        Globals {
            ladder: LadderKind::Cycle,
            today: NaiveDate::from_ymd_opt(2023, 2, 1),
        }
    }

    #[test]
    fn locate_splits_directory_and_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("notes.md");
        fs::write(&file, "x").expect("write");

        let (root, doc) = locate(&file).expect("locate");
        assert_eq!(root, fs::canonicalize(tmp.path()).expect("canonical"));
        assert_eq!(doc, DocId::new("notes.md"));
        assert!(locate(tmp.path()).is_err());
    }

    #[tokio::test]
    async fn scan_rewrites_file_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("study.md");
        fs::write(&file, "- [x] Task 2 #repeat_7\n").expect("write");

        handle_scan(
            ScanArgs {
                inputs: vec![file.clone()],
                dry_run: false,
                json: true,
            },
            globals(),
        )
        .await
        .expect("scan");

        assert_eq!(
            fs::read_to_string(&file).expect("read"),
            "- [x] Task 2 #repeat_7 #nextscheduled\n- [ ] Task 2 📅 2023-02-08 #repeat_7\n"
        );
    }

    #[tokio::test]
    async fn dry_run_leaves_file_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("study.md");
        let text = "- [x] Task 3 #revise ✅ 2023-01-01\n";
        fs::write(&file, text).expect("write");

        handle_scan(
            ScanArgs {
                inputs: vec![file.clone()],
                dry_run: true,
                json: false,
            },
            globals(),
        )
        .await
        .expect("dry run");

        assert_eq!(fs::read_to_string(&file).expect("read"), text);
    }

    #[tokio::test]
    async fn scan_all_walks_the_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("topics");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("a.md"), "- [x] A #revise_7 ^id1").expect("write a");
        fs::write(tmp.path().join("b.txt"), "- [x] B #revise_7").expect("write b");

        handle_scan_all(
            ScanAllArgs {
                dir: tmp.path().to_path_buf(),
                ext: "md".to_string(),
                json: true,
            },
            globals(),
        )
        .await
        .expect("scan all");

        assert_eq!(
            fs::read_to_string(nested.join("a.md")).expect("read a"),
            "- [x] A #revise_7 #nextscheduled ^id1\n- [ ] A 📅 2023-03-03 #revise_30"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("b.txt")).expect("read b"),
            "- [x] B #revise_7"
        );
    }

    #[test]
    fn cli_parses_global_options() {
        let cli = Cli::try_parse_from([
            "revise",
            "--ladder",
            "terminating",
            "next",
            "- [x] a #revise",
            "--today",
            "2024-01-01",
        ])
        .expect("parse");
        assert!(matches!(cli.ladder, LadderArg::Terminating));
        assert_eq!(cli.today, NaiveDate::from_ymd_opt(2024, 1, 1));
        match cli.command {
            Commands::Next(args) => assert_eq!(args.line, "- [x] a #revise"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn next_accepts_a_line_starting_with_a_dash() {
        let cli = Cli::try_parse_from(["revise", "next", "- [x] Read chapter 3 #revise", "--json"])
            .expect("parse");
        match cli.command {
            Commands::Next(args) => {
                assert_eq!(args.line, "- [x] Read chapter 3 #revise");
                assert!(args.json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
