use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabletalk::aggregate::{CancelHandle, Progress, ProgressFn};
use tabletalk::analyser::{AnalysisResult, summary};
use tabletalk::config::{Settings, load_settings};
use tabletalk::ingest::{DataSource, Fingerprint};
use tabletalk::memory::{ClearScope, MemoryStore, RetentionPolicy};
use tabletalk::session::{RECENT_QUESTIONS, Session};
use tabletalk::utils::fmt_bytes;

#[derive(Parser)]
#[command(
    name = "tabletalk",
    about = "Exploratory analysis and conversational Q&A over large CSV files"
)]
pub struct Cli {
    /// Memory file to use instead of the configured one
    #[arg(long, global = true, env = "TABLETALK_MEMORY")]
    pub memory_file: Option<PathBuf>,

    /// Number of partition workers (0 = all cores)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyse a CSV file and print its statistics
    Analyze {
        /// Path to the CSV file, or `-` for stdin
        file: PathBuf,

        /// Size in bytes to classify the file by, instead of its length on disk
        #[arg(long, allow_hyphen_values = true)]
        declared_size: Option<i64>,

        /// Print the full analysis as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask a question about a CSV file
    Ask {
        /// Path to the CSV file
        file: PathBuf,

        /// The question, in English or Portuguese
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Size in bytes to classify the file by, instead of its length on disk
        #[arg(long, allow_hyphen_values = true)]
        declared_size: Option<i64>,
    },
    /// Draw conclusions from a file's analysis and the questions asked about it
    Conclude {
        /// Path to the CSV file, or `-` for stdin
        file: PathBuf,

        /// Size in bytes to classify the file by, instead of its length on disk
        #[arg(long, allow_hyphen_values = true)]
        declared_size: Option<i64>,

        /// Keep the conclusions in memory for later questions
        #[arg(long)]
        save: bool,
    },
    /// Inspect or clear conversational memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
pub enum MemoryAction {
    /// List stored questions and answers
    Show {
        /// Only this dataset
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Count the questions asked about one dataset and list the latest
    Summary {
        /// Dataset fingerprint, or a unique prefix of it
        fingerprint: String,
    },
    /// Delete stored questions and answers
    Clear {
        /// Only this dataset
        #[arg(long)]
        fingerprint: Option<String>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut settings = load_settings();
    if let Some(path) = cli.memory_file {
        settings.memory.path = Some(path);
    }
    if let Some(workers) = cli.workers {
        settings.aggregate.workers = workers;
    }

    match cli.command {
        Commands::Analyze {
            file,
            declared_size,
            json,
        } => handle_analyze(settings, &file, declared_size, json).await,
        Commands::Ask {
            file,
            question,
            declared_size,
        } => handle_ask(settings, &file, &question.join(" "), declared_size).await,
        Commands::Conclude {
            file,
            declared_size,
            save,
        } => handle_conclude(settings, &file, declared_size, save).await,
        Commands::Memory { action } => handle_memory(&settings, action),
    }
}

async fn load(
    settings: Settings,
    file: &Path,
    declared_size: Option<i64>,
    quiet: bool,
) -> Result<(Session, Fingerprint)> {
    let session = Session::from_settings(settings)?;
    let mut source = if file == Path::new("-") {
        DataSource::from_reader("stdin", std::io::stdin().lock(), None)?
    } else {
        DataSource::from_path(file)
            .with_context(|| format!("Failed to open {}", file.display()))?
    };
    if let Some(size) = declared_size {
        source = source.with_declared_size(size);
    }

    let dataset = session.load(source).await?;
    if !quiet {
        println!(
            "{} [{}]: {} rows, {} columns, {} ({}, {} partitions)",
            dataset.name,
            dataset.fingerprint.short(),
            dataset.row_count,
            dataset.schema.len(),
            fmt_bytes(dataset.byte_size),
            dataset.policy.describe(),
            dataset.partition_count,
        );
    }
    Ok((session, dataset.fingerprint.clone()))
}

/// Runs the analysis, cancelling it on Ctrl-C.
async fn analyse(session: &Session, fingerprint: &Fingerprint) -> Result<Arc<AnalysisResult>> {
    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let progress: ProgressFn = Arc::new(|p: Progress| {
        tracing::debug!(
            done = p.partitions_done,
            total = p.partitions_total,
            "Partition finished"
        );
    });
    let result = session
        .get_analysis_with(fingerprint, &cancel, Some(progress))
        .await;
    interrupt.abort();
    Ok(result?)
}

async fn handle_analyze(
    settings: Settings,
    file: &Path,
    declared_size: Option<i64>,
    json: bool,
) -> Result<()> {
    let (session, fingerprint) = load(settings, file, declared_size, json).await?;
    let analysis = analyse(&session, &fingerprint).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*analysis)?);
        return Ok(());
    }

    println!();
    println!("{}", summary::descriptive(&analysis, &[]));
    println!();
    println!("{}", summary::correlations(&analysis, &[]));
    println!();
    println!("{}", summary::anomalies(&analysis, &[]));
    if !analysis.partition_errors.is_empty() {
        println!();
        for failure in &analysis.partition_errors {
            println!("{failure}");
        }
    }
    Ok(())
}

async fn handle_ask(
    settings: Settings,
    file: &Path,
    question: &str,
    declared_size: Option<i64>,
) -> Result<()> {
    let (session, fingerprint) = load(settings, file, declared_size, false).await?;
    // Analyse up front so Ctrl-C can interrupt the long part.
    analyse(&session, &fingerprint).await?;

    let answer = session.submit(question, &fingerprint).await?;
    println!();
    println!("{}", answer.text);
    println!();
    println!(
        "({}, answered by {}, {:.1}% of rows)",
        answer.kind,
        answer.source.as_str(),
        answer.coverage * 100.0
    );
    Ok(())
}

async fn handle_conclude(
    settings: Settings,
    file: &Path,
    declared_size: Option<i64>,
    save: bool,
) -> Result<()> {
    let (session, fingerprint) = load(settings, file, declared_size, false).await?;
    analyse(&session, &fingerprint).await?;

    let conclusions = if save {
        session.record_conclusions(&fingerprint).await?
    } else {
        session.conclusions(&fingerprint).await?
    };
    println!();
    if conclusions.is_empty() {
        println!("Nothing to conclude yet. Ask a few questions first.");
    }
    for conclusion in &conclusions {
        println!("- {conclusion}");
    }
    Ok(())
}

/// Accepts a unique prefix, such as the short form printed by `memory show`.
fn resolve(store: &MemoryStore, given: &str) -> Fingerprint {
    let stats = store.stats();
    let mut matches = stats
        .per_dataset
        .keys()
        .filter(|fp| fp.as_str().starts_with(given));
    match (matches.next(), matches.next()) {
        (Some(only), None) => only.clone(),
        _ => Fingerprint::from(given),
    }
}

fn handle_memory(settings: &Settings, action: MemoryAction) -> Result<()> {
    let store = MemoryStore::open(
        settings.memory_path(),
        RetentionPolicy::from_config(&settings.memory),
    )?;

    match action {
        MemoryAction::Show { fingerprint } => {
            let stats = store.stats();
            println!(
                "{} records across {} datasets ({})",
                stats.total_records,
                stats.per_dataset.len(),
                fmt_bytes(stats.file_bytes)
            );
            if let Some(path) = &stats.path {
                println!("File: {}", path.display());
            }

            let records = match fingerprint {
                Some(fp) => store.query(&resolve(&store, &fp)),
                None => store.all(),
            };
            for record in records {
                println!();
                println!(
                    "[{}] {} {} via {}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.fingerprint.short(),
                    record.kind,
                    record.source.as_str()
                );
                println!("Q: {}", record.question);
                println!("A: {}", record.answer);
            }
        }
        MemoryAction::Summary { fingerprint } => {
            let summary = store.summary(&resolve(&store, &fingerprint), RECENT_QUESTIONS);
            println!(
                "{}: {} questions, {} recorded conclusions",
                summary.fingerprint.short(),
                summary.total_questions,
                summary.conclusions_recorded
            );
            for (kind, count) in &summary.by_kind {
                println!("  {kind}: {count}");
            }
            if !summary.recent.is_empty() {
                println!("Recent questions:");
                for record in &summary.recent {
                    println!(
                        "  [{}] {}",
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.question
                    );
                }
            }
        }
        MemoryAction::Clear { fingerprint } => {
            let scope = match fingerprint {
                Some(fp) => ClearScope::Dataset(resolve(&store, &fp)),
                None => ClearScope::All,
            };
            let removed = store.clear(&scope)?;
            println!("Removed {removed} records");
        }
    }
    Ok(())
}
