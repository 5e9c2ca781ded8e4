//! Self-healing CI pipeline CLI.
//!
//! `healer run` heals one repository on the `{TEAM}_{LEADER}_AI_Fix` branch
//! and prints the canonical result JSON. Configuration is read from
//! `.healer/config.toml` in the working directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use healer::core::branch::branch_name;
use healer::exit_codes;
use healer::io::config::{HealerConfig, load_config, write_config};
use healer::logging;
use healer::pipeline::{RunRequest, config_path, generate_run_id, run_pipeline};
use healer::tools::classifier::classify_log;

#[derive(Parser)]
#[command(name = "healer", version, about = "Self-healing CI pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.healer/config.toml` with default settings.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Heal a repository and print the result document.
    Run {
        /// Local checkout of the repository.
        #[arg(long)]
        repo: PathBuf,
        /// Remote URL used for CI lookups.
        #[arg(long)]
        repo_url: String,
        #[arg(long)]
        team: String,
        #[arg(long)]
        leader: String,
        /// Override `loop.max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Commit locally without pushing.
        #[arg(long)]
        no_push: bool,
    },
    /// Classify a failure log with the pattern layer and print bug records.
    Classify {
        log: PathBuf,
        /// Repository root used to relativize paths and re-attribute traces.
        #[arg(long)]
        repo: Option<PathBuf>,
    },
    /// Print the branch name for a team and leader.
    Branch {
        #[arg(long)]
        team: String,
        #[arg(long)]
        leader: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            repo,
            repo_url,
            team,
            leader,
            max_iterations,
            no_push,
        } => {
            let request = RunRequest {
                repo,
                repo_url,
                team,
                leader,
                run_id: generate_run_id(),
                push: !no_push,
            };
            cmd_run(request, max_iterations)
        }
        Command::Classify { log, repo } => cmd_classify(&log, repo.as_deref()),
        Command::Branch { team, leader } => cmd_branch(&team, &leader),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let path = config_path(Path::new("."));
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_config(&path, &HealerConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(request: RunRequest, max_iterations: Option<u32>) -> Result<i32> {
    if request.team.trim().is_empty() || request.leader.trim().is_empty() {
        bail!("--team and --leader must be non-empty");
    }
    if !request.repo.is_dir() {
        bail!("repository {} is not a directory", request.repo.display());
    }
    let mut cfg = load_config(&config_path(Path::new(".")))?;
    if let Some(max) = max_iterations {
        cfg.loop_.max_iterations = max;
        cfg.validate()?;
    }

    let report = run_pipeline(&cfg, &request)?;
    print!("{}", report.result.to_pretty_json()?);
    eprintln!(
        "{}: {} iteration(s), {} fix(es), results at {}",
        report.outcome.status.as_str(),
        report.outcome.iterations_used,
        report.outcome.total_fixes_applied,
        report.paths.result_path.display()
    );
    Ok(exit_codes::for_status(report.outcome.status))
}

fn cmd_classify(log: &Path, repo: Option<&Path>) -> Result<i32> {
    let text = fs::read_to_string(log).with_context(|| format!("read {}", log.display()))?;
    let root = repo.map(|path| path.to_string_lossy().into_owned());
    let bugs = classify_log(&text, root.as_deref(), None);
    let mut payload = serde_json::to_string_pretty(&bugs).context("serialize bug records")?;
    payload.push('\n');
    print!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_branch(team: &str, leader: &str) -> Result<i32> {
    println!("{}", branch_name(team, leader));
    Ok(exit_codes::OK)
}
