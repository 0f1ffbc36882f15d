//! twinpane - file operations from the command line.
//!
//! Usage:
//!   twinpane copy SOURCE... DEST     Copy entries into DEST
//!   twinpane move SOURCE... DEST     Move entries into DEST
//!   twinpane delete PATH...          Delete entries recursively
//!   twinpane mkdir PARENT NAME       Create a directory
//!   twinpane size PATH...            Total size of the given entries
//!   twinpane --help                  Show help

use std::future::Future;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{bail, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use twinpane_core::{EngineConfig, EngineError, FileItem};
use twinpane_ops::{
    auto_rename_path, BatchSummary, ChannelSink, Conflict, ConflictAnswer, ConflictDecider,
    ConflictResolver, Decision, DefaultLabels, FileOperationsManager, ItemState, Label,
    LabelLookup, OperationEvent, OperationItem, OperationKind, TableLabels,
};

#[derive(Parser)]
#[command(
    name = "twinpane",
    version,
    about = "Copy, move and delete files the way a dual-panel file manager does",
    long_about = "twinpane runs file operations as batches of items: every entry gets \
                  its own outcome, conflicts are resolved per item and Ctrl-C cancels \
                  the batch without leaving partial files behind."
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct EngineArgs {
    /// Number of items processed at once
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Copy buffer size (e.g., "64KB", "1MB")
    #[arg(long, global = true)]
    chunk_size: Option<String>,

    /// Do not copy modification times and permissions
    #[arg(long, global = true)]
    no_preserve: bool,

    /// JSON file with display labels ("state.completed": "...")
    #[arg(long, global = true)]
    labels: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Do not print progress
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Copy entries into a directory
    Copy {
        /// Entries to copy
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination directory (created if missing)
        destination: PathBuf,

        /// What to do when the destination is occupied
        #[arg(short = 'c', long, default_value = "ask")]
        on_conflict: ConflictMode,
    },

    /// Move entries into a directory
    Move {
        /// Entries to move
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Destination directory (created if missing)
        destination: PathBuf,

        /// What to do when the destination is occupied
        #[arg(short = 'c', long, default_value = "ask")]
        on_conflict: ConflictMode,
    },

    /// Delete entries, directories recursively
    Delete {
        /// Entries to delete
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Create a directory
    Mkdir {
        /// Parent directory
        parent: PathBuf,

        /// Name of the new directory
        name: String,

        /// What to do when the name is taken
        #[arg(short = 'c', long, default_value = "skip")]
        on_conflict: ConflictMode,
    },

    /// Compute the total size of entries
    Size {
        /// Entries to measure
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictMode {
    Skip,
    Overwrite,
    Rename,
    Merge,
    Ask,
}

impl ConflictMode {
    fn resolver(self) -> ConflictResolver {
        match self {
            Self::Skip => ConflictResolver::Skip,
            Self::Overwrite => ConflictResolver::Overwrite,
            Self::Rename => ConflictResolver::Rename,
            Self::Merge => ConflictResolver::Merge,
            Self::Ask => ConflictResolver::ask(PromptDecider),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let labels = load_labels(cli.engine.labels.as_deref())?;
    let manager = FileOperationsManager::new(engine_config(&cli.engine)?);
    let format = cli.engine.format;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling...");
            token.cancel();
        }
    });

    let (sink, mut events) = ChannelSink::new();
    let sink = Arc::new(sink);
    let mut printer = Printer::new(labels.clone(), cli.engine.quiet);

    match cli.command {
        Command::Copy {
            sources,
            destination,
            on_conflict,
        } => {
            let items = snapshot(&sources)?;
            let run = manager.copy_items(&items, &destination, on_conflict.resolver(), sink, cancel);
            let result = follow(run, &mut events, &mut printer).await?;
            report(OperationKind::Copy, &result, format, labels.as_ref())?;
        }
        Command::Move {
            sources,
            destination,
            on_conflict,
        } => {
            let items = snapshot(&sources)?;
            let run = manager.move_items(&items, &destination, on_conflict.resolver(), sink, cancel);
            let result = follow(run, &mut events, &mut printer).await?;
            report(OperationKind::Move, &result, format, labels.as_ref())?;
        }
        Command::Delete { paths } => {
            let items = snapshot(&paths)?;
            let run = manager.delete_items(&items, sink, cancel);
            let result = follow(run, &mut events, &mut printer).await?;
            report(OperationKind::Delete, &result, format, labels.as_ref())?;
        }
        Command::Mkdir {
            parent,
            name,
            on_conflict,
        } => {
            let item = manager
                .create_directory(&parent, &name, on_conflict.resolver())
                .await?;
            report(
                OperationKind::CreateDirectory,
                std::slice::from_ref(&item),
                format,
                labels.as_ref(),
            )?;
        }
        Command::Size { paths } => {
            let items = snapshot(&paths)?;
            let run = manager.calculate_size(&items, sink, cancel);
            let total = follow(run, &mut events, &mut printer).await?;
            match format {
                OutputFormat::Text => println!("{} ({} bytes)", format_size(total), total),
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "bytes": total }));
                }
            }
        }
    }

    Ok(())
}

fn engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut builder = EngineConfig::builder();
    if let Some(jobs) = args.jobs {
        builder.concurrency(jobs);
    }
    if let Some(chunk_size) = &args.chunk_size {
        builder.chunk_size(parse_size(chunk_size)? as usize);
    }
    if args.no_preserve {
        builder.preserve_timestamps(false).preserve_permissions(false);
    }
    Ok(builder.build().map_err(EngineError::from)?)
}

fn load_labels(path: Option<&Path>) -> Result<Arc<dyn LabelLookup>> {
    let Some(path) = path else {
        return Ok(Arc::new(DefaultLabels));
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read labels from {}", path.display()))?;
    let labels = TableLabels::from_json(&json).context("Invalid labels file")?;
    Ok(Arc::new(labels))
}

/// Snapshot the entries named on the command line.
fn snapshot(paths: &[PathBuf]) -> Result<Vec<FileItem>> {
    paths
        .iter()
        .map(|path| {
            FileItem::from_path(path).with_context(|| format!("Cannot access {}", path.display()))
        })
        .collect()
}

/// Await an engine call while printing the events it produces.
async fn follow<T>(
    run: impl Future<Output = Result<T, EngineError>>,
    events: &mut UnboundedReceiver<OperationEvent>,
    printer: &mut Printer,
) -> Result<T> {
    tokio::pin!(run);
    loop {
        tokio::select! {
            result = &mut run => {
                while let Ok(event) = events.try_recv() {
                    printer.show(event);
                }
                printer.finish();
                return Ok(result?);
            }
            Some(event) = events.recv() => printer.show(event),
        }
    }
}

/// Renders progress events on stderr.
struct Printer {
    labels: Arc<dyn LabelLookup>,
    quiet: bool,
    line_open: bool,
}

impl Printer {
    fn new(labels: Arc<dyn LabelLookup>, quiet: bool) -> Self {
        Self {
            labels,
            quiet,
            line_open: false,
        }
    }

    fn show(&mut self, event: OperationEvent) {
        if self.quiet {
            return;
        }
        match event {
            OperationEvent::Sizing(sizing) if !sizing.finished => {
                eprint!(
                    "\r Measuring: {} files, {} dirs, {}    ",
                    sizing.files_seen,
                    sizing.dirs_seen,
                    format_size(sizing.bytes_seen)
                );
                self.line_open = true;
            }
            OperationEvent::Batch(progress) => {
                eprint!(
                    "\r {:>5.1}%  {} / {}  ({}/{} items)    ",
                    progress.percentage(),
                    format_size(progress.bytes_processed),
                    format_size(progress.bytes_total),
                    progress.items_completed,
                    progress.items_total
                );
                self.line_open = true;
            }
            OperationEvent::Terminal(item) if item.state() == ItemState::Failed => {
                self.finish();
                if let Some(error) = item.error() {
                    eprintln!(
                        " {}: {} ({})",
                        self.labels.label(Label::Error(error.kind)),
                        error.path.display(),
                        error.message
                    );
                }
            }
            _ => {}
        }
    }

    fn finish(&mut self) {
        if self.line_open {
            eprintln!();
            self.line_open = false;
        }
    }
}

/// Print the outcome of a batch. Fails if any item did not complete.
fn report(
    kind: OperationKind,
    items: &[OperationItem],
    format: OutputFormat,
    labels: &dyn LabelLookup,
) -> Result<()> {
    let summary = BatchSummary::from_items(kind, items);

    match format {
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(60));
            println!(" {}: {}", labels.label(Label::Kind(kind)), summary.summary());
            println!(" {} processed", format_size(summary.bytes_processed));
            println!("{}", "─".repeat(60));

            for item in items.iter().filter(|i| i.state() != ItemState::Completed) {
                let state = labels.label(Label::State(item.state()));
                match item.error() {
                    Some(error) => println!(
                        "   {:<12} {} - {}: {}",
                        state,
                        item.source().display(),
                        labels.label(Label::Error(error.kind)),
                        error.message
                    ),
                    None => println!("   {:<12} {}", state, item.source().display()),
                }
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "summary": summary,
                "items": items,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if summary.failed > 0 || summary.cancelled > 0 {
        bail!(
            "{} failed, {} cancelled",
            summary.failed,
            summary.cancelled
        );
    }
    Ok(())
}

/// Asks about each conflict on the terminal.
struct PromptDecider;

impl ConflictDecider for PromptDecider {
    fn request_decision(&self, conflict: &Conflict) -> ConflictAnswer {
        eprintln!();
        eprintln!(" {}: {}", conflict.kind, conflict.destination.display());
        if let Some(incoming) = &conflict.incoming {
            eprintln!("   incoming  {}", describe(incoming));
        }
        eprintln!("   existing  {}", describe(&conflict.existing));
        eprint!(" [o]verwrite [s]kip [r]ename [NAME] [m]erge [a]bort (capital = for all): ");

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => ConflictAnswer::Abort,
            Ok(_) => parse_answer(line.trim(), conflict),
        }
    }
}

fn describe(item: &FileItem) -> String {
    let size = if item.is_dir() {
        "directory".to_string()
    } else {
        item.format_size()
    };
    format!("{}, modified {}", size, item.format_modified("%Y-%m-%d %H:%M"))
}

/// Turn a typed reply into an answer. An empty reply skips.
fn parse_answer(input: &str, conflict: &Conflict) -> ConflictAnswer {
    let mut chars = input.chars();
    let Some(choice) = chars.next() else {
        return ConflictAnswer::Once(Decision::Skip);
    };
    let rest = chars.as_str().trim();

    let decision = match choice.to_ascii_lowercase() {
        'o' => Decision::Overwrite,
        's' => Decision::Skip,
        'm' => Decision::MergeDirectories,
        'r' if !rest.is_empty() => Decision::Rename(rest.to_string()),
        'r' => {
            let renamed = auto_rename_path(&conflict.destination, &|p: &Path| p.exists());
            match renamed.file_name().and_then(|n| n.to_str()) {
                Some(name) => Decision::Rename(name.to_string()),
                None => Decision::Skip,
            }
        }
        _ => return ConflictAnswer::Abort,
    };

    if choice.is_ascii_uppercase() {
        ConflictAnswer::ForAll(decision)
    } else {
        ConflictAnswer::Once(decision)
    }
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Parse a size string (e.g., "64KB", "1MB").
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.trim_end_matches(|c: char| !c.is_ascii_digit() && c != '.');
    let unit = &s[digits.len()..];

    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => bail!("Unknown size unit: {}", unit),
    };
    let num: f64 = digits
        .parse()
        .with_context(|| format!("Invalid size: {}", s))?;

    Ok((num * multiplier as f64) as u64)
}
