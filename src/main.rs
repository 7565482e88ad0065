// hashlookup command line tool
// Manages the hash set registry and classifies files against it

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use hashlookup::hash::{
    CancelToken, Classification, HashComputer, HashLookupSettings, HashRecord, HashSetParser,
    HashSetRegistry, Md5Hash, ReindexStatus, SetOptions, SourceFormat,
};
use hashlookup::ingest::{
    ClassificationEngine, ClassificationResult, ClassifierOptions, Disposition, FileSubject,
    JobSummary, MemoryArtifactSink, MemoryJobContext, MessageLevel,
};

/// Forensic hash set manager and known/notable file classifier
#[derive(Parser)]
#[command(name = "hashlookup", version, about)]
struct Cli {
    /// Settings file holding the configured hash sets
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Folder of official `<name>.<Classification>.kdb` hash sets
    #[arg(long, global = true)]
    official_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and index a hash set file, then add it to the registry
    Import {
        name: String,
        path: PathBuf,
        #[command(flatten)]
        set: SetArgs,
    },

    /// Create a new, empty, updatable .kdb hash set
    Create {
        name: String,
        path: PathBuf,
        #[command(flatten)]
        set: SetArgs,
    },

    /// Add hashes to an updatable hash set
    AddHashes {
        name: String,
        /// Hash set file to copy every hash from
        #[arg(long)]
        from: Option<PathBuf>,
        /// Format of the --from file when not detectable from its name
        #[arg(long, value_parser = parse_format)]
        format: Option<SourceFormat>,
        /// Comment attached to hashes given on the command line
        #[arg(long)]
        comment: Option<String>,
        /// MD5 hashes in hex
        hashes: Vec<String>,
    },

    /// Rebuild the index of a hash set
    Index { name: String },

    /// List configured hash sets
    List,

    /// Remove a hash set from the registry (files are left in place)
    Remove { name: String },

    /// Look up MD5 hashes in every searchable hash set
    Lookup {
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Hash files and classify them as known or notable
    Classify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Write a JSON report of every classified file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Record a hit for every matching notable set, not only the first
        #[arg(long)]
        all_hits: bool,
        /// Print unknown files too
        #[arg(long)]
        show_all: bool,
    },
}

#[derive(clap::Args)]
struct SetArgs {
    #[arg(short, long, value_enum, default_value_t = ClassArg::Notable)]
    class: ClassArg,
    /// Override format detection
    #[arg(long, value_parser = parse_format)]
    format: Option<SourceFormat>,
    #[arg(long)]
    read_only: bool,
    /// Register the set without searching it during classification
    #[arg(long)]
    no_search: bool,
    /// Post a message for every hit (notable and no-change sets only)
    #[arg(long)]
    notify: Option<bool>,
}

impl SetArgs {
    fn options(&self) -> SetOptions {
        SetOptions {
            format: self.format,
            read_only: self.read_only,
            search_enabled: !self.no_search,
            notify_on_hit: self.notify,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Known,
    Notable,
    NoChange,
}

impl From<ClassArg> for Classification {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Known => Classification::Known,
            ClassArg::Notable => Classification::Notable,
            ClassArg::NoChange => Classification::NoChange,
        }
    }
}

fn parse_format(name: &str) -> Result<SourceFormat, String> {
    SourceFormat::from_name(name).ok_or_else(|| {
        format!("unknown format '{}' (expected idx, encase, hashkeeper, nsrl, kdb or index)", name)
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut registry = open_registry(&cli)?;

    match cli.command {
        Commands::Import { name, path, set } => cmd_import(&mut registry, &name, &path, &set),
        Commands::Create { name, path, set } => {
            let created = registry
                .create_new(&name, &path, set.class.into(), set.options())
                .with_context(|| format!("Failed to create hash set '{}'", name))?;
            println!("{} {} ({})", "Created".green(), created.name(), created.location());
            Ok(())
        }
        Commands::AddHashes { name, from, format, comment, hashes } => {
            cmd_add_hashes(&registry, &name, from.as_deref(), format, comment, &hashes)
        }
        Commands::Index { name } => cmd_index(&registry, &name),
        Commands::List => {
            cmd_list(&registry);
            Ok(())
        }
        Commands::Remove { name } => {
            registry
                .remove(&name)
                .with_context(|| format!("Failed to remove hash set '{}'", name))?;
            println!("{} {}", "Removed".green(), name);
            Ok(())
        }
        Commands::Lookup { hashes } => cmd_lookup(&registry, &hashes),
        Commands::Classify { paths, report, all_hits, show_all } => {
            cmd_classify(&registry, &paths, report.as_deref(), all_hits, show_all)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_registry(cli: &Cli) -> Result<HashSetRegistry> {
    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => HashLookupSettings::default_path()
            .ok_or_else(|| anyhow!("No configuration directory found; pass --config"))?,
    };
    let mut registry = HashSetRegistry::new().with_settings_path(settings_path.clone());
    if let Some(dir) = &cli.official_dir {
        registry = registry.with_official_dir(dir.clone());
    }

    let report = registry
        .load()
        .with_context(|| format!("Failed to load hash set settings from {}", settings_path.display()))?;
    for failure in &report.failures {
        eprintln!("{} hash set '{}' could not be loaded: {}", "Warning:".yellow(), failure.name, failure.error);
    }
    for (old, new) in &report.renamed {
        eprintln!("{} hash set '{}' renamed to '{}' (an official set uses that name)", "Note:".cyan(), old, new);
    }
    Ok(registry)
}

fn progress_bar(len: u64, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

fn cmd_import(registry: &mut HashSetRegistry, name: &str, path: &Path, set: &SetArgs) -> Result<()> {
    let pb = progress_bar(0, "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/~{len} hashes | {msg}");
    pb.set_message(name.to_string());
    let progress = |done: usize, estimate: u64| {
        pb.set_length(estimate.max(done as u64));
        pb.set_position(done as u64);
    };

    let cancel = CancelToken::new();
    let result = registry.import(name, path, set.class.into(), set.options(), &cancel, Some(&progress));
    pb.finish_and_clear();

    let imported = result.with_context(|| format!("Failed to import '{}' from {}", name, path.display()))?;
    println!(
        "{} {} [{}] {} hashes ({})",
        "Imported".green(),
        imported.name(),
        imported.classification(),
        imported
            .entry_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string()),
        imported.location()
    );
    Ok(())
}

fn cmd_add_hashes(
    registry: &HashSetRegistry,
    name: &str,
    from: Option<&Path>,
    format: Option<SourceFormat>,
    comment: Option<String>,
    hashes: &[String],
) -> Result<()> {
    let set = registry
        .find(name)
        .ok_or_else(|| anyhow!("No hash set named '{}'", name))?;

    let mut records = Vec::with_capacity(hashes.len());
    for text in hashes {
        let md5 = Md5Hash::from_hex(text).ok_or_else(|| anyhow!("'{}' is not an MD5 hash", text))?;
        let mut record = HashRecord::new(md5);
        if let Some(comment) = &comment {
            record = record.with_comment(comment.clone());
        }
        records.push(record);
    }

    let mut added = set
        .add_records(&records)
        .with_context(|| format!("Failed to add hashes to '{}'", name))?;

    if let Some(source) = from {
        let mut parser = match format {
            Some(format) => HashSetParser::open_as(source, format),
            None => HashSetParser::open(source),
        }
        .with_context(|| format!("Failed to open {}", source.display()))?;
        added += set
            .add_from_parser(&mut parser, &CancelToken::new())
            .with_context(|| format!("Failed to copy hashes from {}", source.display()))?;
    }

    println!("{} {} hashes to {}", "Added".green(), added, set.name());
    if !set.is_valid() {
        println!("Run `hashlookup index {}` before the new hashes are searched.", set.name());
    }
    Ok(())
}

fn cmd_index(registry: &HashSetRegistry, name: &str) -> Result<()> {
    let mut handle = registry
        .reindex(name)
        .with_context(|| format!("Failed to start indexing '{}'", name))?;

    let pb = progress_bar(0, "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/~{len} hashes | {msg}");
    pb.set_message(format!("indexing {}", name));
    while !handle.poll() {
        let (done, estimate) = handle.progress();
        pb.set_length(estimate.max(done));
        pb.set_position(done);
        thread::sleep(Duration::from_millis(100));
    }
    pb.finish_and_clear();

    let status = handle.status();
    handle
        .wait()
        .with_context(|| format!("Failed to index '{}'", name))?;
    match status {
        ReindexStatus::Built => println!("{} {}", "Indexed".green(), name),
        other => println!("{} {:?}", name, other),
    }
    Ok(())
}

fn cmd_list(registry: &HashSetRegistry) {
    let sets = registry.all_sets();
    if sets.is_empty() && registry.unloaded().is_empty() {
        println!("No hash sets configured.");
        return;
    }

    for set in &sets {
        let state = if set.is_valid() {
            set.state().describe().green()
        } else {
            set.state().describe().red()
        };
        let size: u64 = set
            .paths()
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let mut flags = Vec::new();
        if set.is_official() {
            flags.push("official");
        }
        if set.is_updatable() {
            flags.push("updatable");
        }
        if !set.search_enabled() {
            flags.push("not searched");
        }
        if set.notify_on_hit() {
            flags.push("notify");
        }
        println!(
            "{:<30} {:<10} {:<12} {:>12} {:>10}  {} {}",
            set.name().bold(),
            set.classification().display_name(),
            state,
            set.entry_count()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            humansize::format_size(size, humansize::BINARY),
            set.location(),
            if flags.is_empty() {
                String::new()
            } else {
                format!("[{}]", flags.join(", "))
            }
        );
    }
    for info in registry.unloaded() {
        println!(
            "{:<30} {:<10} {}",
            info.name.bold(),
            info.classification.display_name(),
            "not loaded".red()
        );
    }
}

fn cmd_lookup(registry: &HashSetRegistry, hashes: &[String]) -> Result<()> {
    let (snapshot, _guard) = registry.begin_job();
    for excluded in snapshot.excluded() {
        eprintln!("{} '{}' skipped: {}", "Warning:".yellow(), excluded.name, excluded.reason);
    }

    let entries = snapshot
        .notable()
        .iter()
        .chain(snapshot.no_change())
        .chain(snapshot.known());
    let entries: Vec<_> = entries.collect();

    for text in hashes {
        let md5 = Md5Hash::from_hex(text).ok_or_else(|| anyhow!("'{}' is not an MD5 hash", text))?;
        let mut found = false;
        for entry in &entries {
            match entry.lookup_verbose(&md5) {
                Ok(Some(hit)) => {
                    found = true;
                    let label = classification_label(entry.classification());
                    println!("{}  {}  {}", md5, label, entry.name());
                    for comment in &hit.comments {
                        println!("    {}", comment);
                    }
                }
                Ok(None) => {}
                Err(e) => eprintln!("{} {}", "Error:".red(), e),
            }
        }
        if !found {
            println!("{}  {}", md5, "not found".dimmed());
        }
    }
    Ok(())
}

fn classification_label(classification: Classification) -> colored::ColoredString {
    match classification {
        Classification::Notable => "NOTABLE".red().bold(),
        Classification::NoChange => "NO CHANGE".yellow(),
        Classification::Known => "KNOWN".green(),
    }
}

#[derive(Serialize)]
struct ClassifyReport<'a> {
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    files: &'a [ClassificationResult],
    summary: &'a JobSummary,
}

fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        for entry_result in jwalk::WalkDir::new(root)
            .parallelism(jwalk::Parallelism::RayonNewPool(0))
            .skip_hidden(false)
            .follow_links(false)
        {
            match entry_result {
                Ok(entry) => {
                    if entry.file_type().is_file() {
                        files.push(entry.path());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "error walking directory"),
            }
        }
    }
    files
}

fn cmd_classify(
    registry: &HashSetRegistry,
    paths: &[PathBuf],
    report: Option<&Path>,
    all_hits: bool,
    show_all: bool,
) -> Result<()> {
    let started = Utc::now();
    let files = collect_files(paths);
    if files.is_empty() {
        bail!("No files found under the given paths");
    }

    let (snapshot, _guard) = registry.begin_job();
    let ctx = MemoryJobContext::new(1);
    let sink = Arc::new(MemoryArtifactSink::new());
    let engine = ClassificationEngine::new(
        snapshot,
        Arc::new(HashComputer::new()),
        ClassifierOptions {
            report_all_hits: all_hits,
            calculate_hashes: true,
        },
    )
    .with_artifact_sink(sink.clone());
    engine.start(&ctx);

    let subjects: Vec<FileSubject> = files
        .into_iter()
        .enumerate()
        .map(|(id, path)| FileSubject::file(id as u64 + 1, path))
        .collect();

    let pb = progress_bar(
        subjects.len() as u64,
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({percent}%) | {msg}",
    );
    let timer = Instant::now();
    let results = engine.classify_all_with_progress(&subjects, &ctx, &|_| pb.inc(1));
    pb.finish_and_clear();
    let summary = engine.finish(&ctx);

    for message in ctx.messages_at(MessageLevel::Warning) {
        eprintln!("{} {} {}", "Warning:".yellow(), message.subject, message.details);
    }
    for message in ctx.messages_at(MessageLevel::Error) {
        eprintln!("{} {}", "Error:".red(), message.subject);
    }

    for result in &results {
        let Some(subject) = subjects.get(result.file_id as usize - 1) else {
            continue;
        };
        let label = match result.disposition {
            Disposition::Notable => "NOTABLE".red().bold(),
            Disposition::Known => "KNOWN".green(),
            Disposition::Unknown if !result.hits.is_empty() => "NO CHANGE".yellow(),
            Disposition::Unknown if show_all => "unknown".dimmed(),
            Disposition::Unknown => continue,
        };
        println!(
            "{:<10} {}  {}{}",
            label,
            result.md5.map(|m| m.to_hex()).unwrap_or_else(|| "-".repeat(32)),
            subject.path.display(),
            result
                .matched_set
                .as_ref()
                .map(|s| format!("  ({})", s))
                .unwrap_or_default()
        );
    }

    println!();
    println!(
        "{} files in {:.2?}: {} notable, {} no change, {} known, {} artifacts",
        results.len(),
        timer.elapsed(),
        summary.notable_hits.to_string().red().bold(),
        summary.no_change_hits.to_string().yellow(),
        summary.known_hits.to_string().green(),
        sink.hits().len()
    );

    if let Some(report_path) = report {
        let report = ClassifyReport {
            started,
            finished: Utc::now(),
            files: &results,
            summary: &summary,
        };
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(report_path, json)
            .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
        println!("Report written to {}", report_path.display());
    }
    Ok(())
}
