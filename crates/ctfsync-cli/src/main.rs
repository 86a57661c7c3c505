use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ctfsync_adapters::CtfdClient;
use ctfsync_core::{mask_flag, Verdict};
use ctfsync_storage::{locate_challenge, AttemptLog, FsWorkspace, WorkspaceStore};
use ctfsync_submit::{
    parse_manifest, resolve_challenge, resolve_flag, submit_bulk, FlagInputs, FlagPrompt,
    SubmissionEngine, SubmitResult,
};
use ctfsync_sync::{sync_status, sync_workspace, CtfConfig, SyncError, SyncOptions, SyncReport};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ctfsync", version)]
#[command(about = "Mirror CTFd challenges locally and submit flags")]
struct Cli {
    /// Workspace root (default: $CTFSYNC_ROOT or ./challenges)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Profile from profiles.yaml
    #[arg(long, global = true)]
    profile: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download challenges into the workspace
    Sync(SyncArgs),
    /// Submit flags
    Submit(SubmitArgs),
    /// Work with the challenge in the current directory
    Cwd {
        #[command(subcommand)]
        action: CwdAction,
    },
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct SyncArgs {
    #[command(subcommand)]
    action: Option<SyncAction>,
    /// Only sync this category
    #[arg(long)]
    category: Option<String>,
    /// Skip attachment downloads
    #[arg(long)]
    no_files: bool,
    /// Only sync the challenge in the current directory
    #[arg(long)]
    current: bool,
}

#[derive(Debug, Subcommand)]
enum SyncAction {
    /// Summarize the last sync without contacting the platform
    Status,
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct SubmitArgs {
    #[command(subcommand)]
    action: Option<SubmitAction>,
    challenge_id: Option<u64>,
    flag: Option<String>,
    /// Prompt for the flag when none is given
    #[arg(long, short)]
    interactive: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SubmitAction {
    /// Submit every `id:flag` line of a manifest
    Bulk {
        manifest: PathBuf,
        #[arg(long, default_value = ":")]
        delimiter: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recorded attempts, newest first
    History {
        #[arg(long)]
        challenge: Option<u64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
enum CwdAction {
    /// Show what the workspace knows about this challenge
    Info,
    /// Submit the flag from flag.txt (or --flag)
    Submit {
        #[arg(long)]
        flag: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

struct TerminalPrompt;

impl FlagPrompt for TerminalPrompt {
    fn prompt_flag(&self, challenge_id: u64) -> Result<Option<String>> {
        let flag = inquire::Password::new(&format!("Flag for challenge {challenge_id}:"))
            .without_confirmation()
            .with_display_mode(inquire::PasswordDisplayMode::Masked)
            .prompt()
            .context("reading flag from terminal")?;
        Ok(Some(flag))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let config = &CtfConfig::from_env()
        .with_root(cli.root)
        .with_profile(cli.profile)
        .with_discovered_root(&cwd);

    match cli.command {
        Commands::Sync(args) => match args.action {
            Some(SyncAction::Status) => status(config).await,
            None => sync(config, args, &cwd).await,
        },
        Commands::Submit(args) => match args.action {
            Some(SubmitAction::Bulk {
                manifest,
                delimiter,
                dry_run,
            }) => bulk(config, &manifest, &delimiter, dry_run).await,
            Some(SubmitAction::History { challenge, limit }) => {
                history(config, challenge, limit).await
            }
            None => {
                let prompt = TerminalPrompt;
                let inputs = FlagInputs {
                    argument: args.flag.as_deref(),
                    prompt: args.interactive.then_some(&prompt as &dyn FlagPrompt),
                    ..FlagInputs::default()
                };
                let store = FsWorkspace::new(&config.root);
                submit_one(config, store, args.challenge_id, Some(&cwd), &inputs, args.dry_run).await
            }
        },
        Commands::Cwd { action } => {
            let store = FsWorkspace::new(&config.root);
            match action {
                CwdAction::Info => cwd_info(&store, &cwd).await,
                CwdAction::Submit { flag, dry_run } => {
                    let inputs = FlagInputs {
                        override_flag: flag.as_deref(),
                        ..FlagInputs::default()
                    };
                    submit_one(config, store, None, Some(&cwd), &inputs, dry_run).await
                }
            }
        }
    }
}

fn client_for(config: &CtfConfig) -> Result<(CtfdClient, String)> {
    let session = config.session()?;
    let client = CtfdClient::new(&session.url, config.http_client_config(&session))?;
    Ok((client, session.profile))
}

async fn sync(config: &CtfConfig, args: SyncArgs, cwd: &Path) -> Result<ExitCode> {
    let store = FsWorkspace::new(&config.root);
    let only_challenge = if args.current {
        let located = locate_challenge(&store, cwd)
            .await?
            .context("--current used outside a synced challenge directory")?;
        Some(located.0)
    } else {
        None
    };

    let (client, profile) = client_for(config)?;
    let options = SyncOptions {
        include_files: !args.no_files,
        category_filter: args.category.clone(),
        only_challenge,
        concurrency: config.concurrency,
    };

    match sync_workspace(&store, &client, &options, &profile).await {
        Ok(report) => {
            print_sync_report(&report, &config.root, args.category.as_deref());
            Ok(ExitCode::SUCCESS)
        }
        Err(SyncError::PartialSync { attempted, failed }) => {
            eprintln!("error: every challenge failed to sync ({failed}/{attempted})");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_sync_report(report: &SyncReport, root: &Path, category: Option<&str>) {
    if report.challenges.is_empty() && report.skipped.is_empty() {
        match (category, &report.suggestion) {
            (Some(wanted), Some(suggestion)) => {
                println!("No challenges in category \"{wanted}\". Did you mean \"{suggestion}\"?")
            }
            (Some(wanted), None) => println!("No challenges in category \"{wanted}\"."),
            _ => println!("The platform listed no challenges."),
        }
        return;
    }

    println!(
        "Synced {} challenges into {} (run {})",
        report.challenges.len(),
        root.display(),
        report.run_id
    );
    println!("{:<20} {:>6} {:>7} {:>10}", "category", "total", "solved", "available");
    for row in &report.categories {
        println!(
            "{:<20} {:>6} {:>7} {:>10}",
            row.category, row.total, row.solved, row.available
        );
    }
    println!("Downloaded {} files", report.downloaded());

    if report.is_partial() {
        eprintln!("warning: {} problem(s) during sync", report.failures());
        for skipped in &report.skipped {
            eprintln!("  - [{}] {}: {}", skipped.id, skipped.name, skipped.reason);
        }
        for challenge in &report.challenges {
            for failure in &challenge.failures {
                eprintln!("  - [{}] {}: {}", challenge.id, challenge.name, failure);
            }
        }
    }
}

async fn status(config: &CtfConfig) -> Result<ExitCode> {
    let store = FsWorkspace::new(&config.root);
    let status = sync_status(&store).await?;
    let Some(last_sync) = status.last_sync else {
        println!("{} has not been synced yet.", config.root.display());
        return Ok(ExitCode::SUCCESS);
    };
    println!(
        "Last sync {} (profile {})",
        last_sync.to_rfc3339(),
        status.profile.as_deref().unwrap_or("unknown")
    );
    for row in &status.categories {
        println!("  {:<20} {:>3}/{:<3} solved", row.category, row.solved, row.total);
    }
    println!(
        "{} of {} challenges solved, {} unsolved",
        status.solved,
        status.total,
        status.total - status.solved
    );
    Ok(ExitCode::SUCCESS)
}

async fn submit_one(
    config: &CtfConfig,
    store: FsWorkspace,
    challenge_id: Option<u64>,
    cwd: Option<&Path>,
    inputs: &FlagInputs<'_>,
    dry_run: bool,
) -> Result<ExitCode> {
    let target = resolve_challenge(&store, challenge_id, cwd).await?;
    let flag = resolve_flag(&store, &target, inputs).await?;

    if dry_run {
        let preview = preview_engine(config, store)?
            .submit(&target, &flag, true)
            .await?;
        if let SubmitResult::DryRun(preview) = preview {
            println!(
                "Would submit {} to challenge {} via {} {}",
                preview.masked_flag, preview.challenge_id, preview.variant, preview.path
            );
            println!("payload: {}", preview.payload);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (client, profile) = client_for(config)?;
    let log = AttemptLog::for_profile(store.root(), &profile);
    let engine = SubmissionEngine::new(client, store, log);
    let SubmitResult::Attempted(receipt) = engine.submit(&target, &flag, false).await? else {
        return Ok(ExitCode::SUCCESS);
    };

    let attempt = &receipt.attempt;
    println!(
        "[{}] {} -> {}: {}",
        attempt.challenge_id,
        mask_flag(&attempt.submitted),
        attempt.verdict,
        attempt.message
    );
    if receipt.marked_solved {
        println!("Marked solved in the workspace.");
    }
    if attempt.verdict == Verdict::RateLimited {
        eprintln!("warning: rate limited; wait before submitting again");
    }
    Ok(if attempt.verdict == Verdict::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Dry runs never touch the network, so they work without credentials.
fn preview_engine(
    config: &CtfConfig,
    store: FsWorkspace,
) -> Result<SubmissionEngine<CtfdClient, FsWorkspace>> {
    let url = config
        .session()
        .map(|s| s.url)
        .unwrap_or_else(|_| "http://localhost".to_string());
    let client = CtfdClient::new(&url, Default::default())?;
    let log = AttemptLog::for_profile(store.root(), &config.profile_name()?);
    Ok(SubmissionEngine::new(client, store, log))
}

async fn bulk(config: &CtfConfig, manifest: &Path, delimiter: &str, dry_run: bool) -> Result<ExitCode> {
    let text = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let parsed = parse_manifest(&text, delimiter);
    for bad in &parsed.malformed {
        eprintln!("warning: line {} skipped ({}): {}", bad.line, bad.reason, bad.content);
    }

    if dry_run {
        for entry in &parsed.entries {
            println!("line {:>3}: challenge {} <- {}", entry.line, entry.challenge_id, mask_flag(&entry.flag));
        }
        println!(
            "{} entries would be submitted, {} malformed",
            parsed.entries.len(),
            parsed.malformed.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let store = FsWorkspace::new(&config.root);
    let (client, profile) = client_for(config)?;
    let log = AttemptLog::for_profile(store.root(), &profile);
    let engine = SubmissionEngine::new(client, store, log);
    let report = submit_bulk(&engine, &parsed).await;

    for item in &report.items {
        println!(
            "line {:>3}: [{}] {} -> {}: {}",
            item.line, item.challenge_id, item.masked_flag, item.verdict, item.message
        );
    }
    println!(
        "{} attempted: {} correct, {} incorrect, {} already solved, {} rate limited, {} errors, {} malformed",
        report.attempted(),
        report.correct,
        report.incorrect,
        report.already_solved,
        report.rate_limited,
        report.errors,
        report.malformed.len()
    );
    println!("Success rate: {:.1}%", report.success_percentage());
    Ok(ExitCode::SUCCESS)
}

async fn history(config: &CtfConfig, challenge: Option<u64>, limit: usize) -> Result<ExitCode> {
    let log = AttemptLog::for_profile(&config.root, &config.profile_name()?);
    let attempts = log.recent(challenge, limit).await?;
    if attempts.is_empty() {
        println!("No attempts recorded in {}", log.path().display());
        return Ok(ExitCode::SUCCESS);
    }
    for attempt in attempts {
        println!(
            "{}  [{}] {:<14} {}  {}",
            attempt.timestamp.format("%Y-%m-%d %H:%M:%S"),
            attempt.challenge_id,
            attempt.verdict.to_string(),
            mask_flag(&attempt.submitted),
            attempt.message
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cwd_info(store: &FsWorkspace, cwd: &Path) -> Result<ExitCode> {
    let target = resolve_challenge(store, None, Some(cwd)).await?;
    let dir = target
        .dir
        .clone()
        .context("challenge directory could not be resolved")?;
    let entry = store
        .read_entry(&dir)
        .await?
        .context("challenge directory disappeared")?;

    let title = entry
        .readme
        .as_deref()
        .and_then(|r| r.lines().next())
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .unwrap_or_default();
    println!("Challenge {}: {}", target.id, title);
    println!("Directory: {}", store.root().join(&dir).display());
    println!("Solved: {}", if entry.flag.solved { "yes" } else { "no" });
    match &entry.flag.candidate {
        Some(flag) => println!("Flag candidate: {}", mask_flag(flag)),
        None => println!("Flag candidate: none"),
    }
    if entry.files.is_empty() {
        println!("Files: none");
    } else {
        println!("Files:");
        for (name, size) in &entry.files {
            println!("  {name} ({size} bytes)");
        }
    }
    Ok(ExitCode::SUCCESS)
}
