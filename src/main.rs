//! Gradebox CLI
//!
//! Check, run or grade a Python submission from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gradebox::{
    analyzer::restricted,
    config::GraderConfig,
    executor::capabilities,
    progress::{SledProgressStore, UserId},
    service::{GradingService, SubmissionRequest},
    JsonTaskCatalog, SafetyAnalyzer, SandboxEngine,
};

/// What to do
#[derive(Debug)]
enum Command {
    Check {
        file: PathBuf,
    },
    Run {
        file: PathBuf,
        timeout: Option<u64>,
    },
    Grade {
        file: PathBuf,
        catalog: PathBuf,
        task: String,
        user: String,
    },
    Probe,
}

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = None;
    let mut verbose = false;
    let mut timeout = None;
    let mut catalog = None;
    let mut task = None;
    let mut user = None;
    let mut positional = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if !arg.starts_with('-') {
            positional.push(arg);
            continue;
        }
        match arg.as_str() {
            "--config" | "-c" => config = Some(PathBuf::from(value(&mut iter, &arg)?)),
            "--verbose" | "-v" => verbose = true,
            "--timeout" | "-t" => {
                let raw = value(&mut iter, &arg)?;
                timeout = Some(
                    raw.parse()
                        .with_context(|| format!("invalid timeout: {raw}"))?,
                );
            }
            "--catalog" => catalog = Some(PathBuf::from(value(&mut iter, &arg)?)),
            "--task" => task = Some(value(&mut iter, &arg)?),
            "--user" => user = Some(value(&mut iter, &arg)?),
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            flag => bail!("unknown option: {flag}"),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("check") => Command::Check {
            file: file_arg(positional.next())?,
        },
        Some("run") => Command::Run {
            file: file_arg(positional.next())?,
            timeout,
        },
        Some("grade") => Command::Grade {
            file: file_arg(positional.next())?,
            catalog: catalog.context("grade requires --catalog FILE")?,
            task: task.context("grade requires --task ID")?,
            user: user.context("grade requires --user NAME")?,
        },
        Some("probe") => Command::Probe,
        Some(other) => bail!("unknown command: {other}"),
        None => {
            print_help();
            std::process::exit(2);
        }
    };

    Ok(Args {
        config,
        verbose,
        command,
    })
}

fn value(iter: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    iter.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn file_arg(arg: Option<String>) -> anyhow::Result<PathBuf> {
    arg.map(PathBuf::from).context("missing submission file")
}

fn print_help() {
    println!("Gradebox {}", gradebox::VERSION);
    println!();
    println!("USAGE:");
    println!("    gradebox [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    check <FILE>                    Static analysis only");
    println!("    run <FILE>                      Run in the sandbox and print the result");
    println!("    grade <FILE>                    Run and grade against a catalog task");
    println!("    probe                           Show available isolation modes");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>             JSON configuration file");
    println!("    -t, --timeout <SECS>            Timeout for run (default: from config)");
    println!("    --catalog <FILE>                Task catalog manifest (grade)");
    println!("    --task <ID>                     Task id (grade)");
    println!("    --user <NAME>                   Acting user (grade)");
    println!("    -v, --verbose                   Debug logging");
    println!("    -h, --help                      Print help");
    println!();
    println!("ENVIRONMENT:");
    println!("    GRADEBOX_TIMEOUT_SECS, GRADEBOX_PYTHON, GRADEBOX_ISOLATION,");
    println!("    GRADEBOX_TESTS_ROOT, GRADEBOX_STORE, RUST_LOG");
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_submission(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn engine(config: &GraderConfig) -> anyhow::Result<Arc<SandboxEngine>> {
    let mode = capabilities::select(config)?;
    let executor = capabilities::executor_for(mode, config)?;
    let engine = SandboxEngine::new(config, Arc::new(config.policy.clone()), executor)?;
    Ok(Arc::new(engine))
}

#[derive(Serialize)]
struct CheckReport {
    is_safe: bool,
    reason: Option<String>,
}

fn check(config: &GraderConfig, file: &Path) -> anyhow::Result<bool> {
    let source = read_submission(file)?;
    let verdict = SafetyAnalyzer::new(Arc::new(config.policy.clone())).analyze(&source);
    let report = if verdict.is_safe {
        match restricted::check_source(&source, &config.policy) {
            Ok(()) => CheckReport {
                is_safe: true,
                reason: None,
            },
            Err(err) => CheckReport {
                is_safe: false,
                reason: Some(err.to_string()),
            },
        }
    } else {
        CheckReport {
            is_safe: false,
            reason: verdict.reason,
        }
    };
    print_json(&report)?;
    Ok(report.is_safe)
}

fn run(config: &GraderConfig, file: &Path, timeout: Option<u64>) -> anyhow::Result<bool> {
    let source = read_submission(file)?;
    let engine = engine(config)?;
    let timeout = timeout.map_or_else(|| engine.default_timeout(), Duration::from_secs);
    let result = engine.execute_with_timeout(&source, timeout);
    print_json(&result)?;
    Ok(result.succeeded)
}

async fn grade(
    config: &GraderConfig,
    file: &Path,
    catalog: &Path,
    task: String,
    user: String,
) -> anyhow::Result<bool> {
    let source = read_submission(file)?;
    let catalog = JsonTaskCatalog::load(catalog)?;
    let store_path = config.store_path();
    std::fs::create_dir_all(&store_path)
        .with_context(|| format!("failed to create {}", store_path.display()))?;
    let store = SledProgressStore::open(&store_path)?;
    debug!(store = %store_path.display(), "progress store ready");

    let service = Arc::new(GradingService::new(
        engine(config)?,
        Arc::new(catalog),
        Arc::new(store),
        config.tests_root.clone(),
    ));
    let response = service
        .grade_async(UserId::new(user), SubmissionRequest::new(source, task))
        .await;
    print_json(&response)?;
    Ok(response.passed())
}

fn probe(config: &GraderConfig) -> anyhow::Result<bool> {
    let capabilities = capabilities::probe(config);
    print_json(&capabilities)?;
    Ok(capabilities
        .checks
        .iter()
        .any(|check| check.available))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = GraderConfig::load(args.config.as_deref())?;
    info!(version = gradebox::VERSION, timeout_secs = config.timeout_secs, "gradebox starting");

    let ok = match args.command {
        Command::Check { file } => check(&config, &file)?,
        Command::Run { file, timeout } => run(&config, &file, timeout)?,
        Command::Grade {
            file,
            catalog,
            task,
            user,
        } => grade(&config, &file, &catalog, task, user).await?,
        Command::Probe => probe(&config)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
