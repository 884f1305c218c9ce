use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskweave::sandbox::Role;
use taskweave::{AgentRuntime, Config};

fn print_help() {
    println!(
        "\
taskweave v{}

Sandboxed runtime for agent definitions.

USAGE:
    taskweave check <FILE> [--config PATH]
    taskweave check-tool <FILE> [--config PATH]
    taskweave run <FILE> [--input JSON] [--config PATH] [--tools FILE]...

COMMANDS:
    check         Validate an agent definition and print the violations as JSON
    check-tool    Validate a tool definition and print the violations as JSON
    run           Load an agent and run its main block

OPTIONS:
    --input JSON     Run inputs as a JSON object [default: {{}}]
    --config PATH    Path to TOML configuration file [default: built-in defaults]
    --tools FILE     Tool definitions to load before the run (repeatable)
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, taskweave=debug,warn)

EXAMPLES:
    taskweave check agents/report.tw
    taskweave run agents/calc.tw --input '{{\"a\": 2, \"b\": 3}}'
    RUST_LOG=debug taskweave run agents/report.tw --config taskweave.toml",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Check {
        file: PathBuf,
        role: Role,
        config: Option<PathBuf>,
    },
    Run {
        file: PathBuf,
        input: Option<String>,
        config: Option<PathBuf>,
        tools: Vec<PathBuf>,
    },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let (command, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("missing command; see --help"))?;
    let mut file = None;
    let mut input = None;
    let mut config = None;
    let mut tools = Vec::new();

    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--input" => input = Some(value("--input")?),
            "--config" => config = Some(PathBuf::from(value("--config")?)),
            "--tools" => tools.push(PathBuf::from(value("--tools")?)),
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            path if file.is_none() => file = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {extra}"),
        }
    }
    let file = file.ok_or_else(|| anyhow!("{command} requires a file"))?;

    match command.as_str() {
        "check" | "check-tool" => {
            if input.is_some() || !tools.is_empty() {
                bail!("{command} only accepts --config");
            }
            let role = if command == "check" { Role::Agent } else { Role::Tool };
            Ok(Command::Check { file, role, config })
        }
        "run" => Ok(Command::Run {
            file,
            input,
            config,
            tools,
        }),
        other => bail!("unknown command {other}; see --help"),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(Config::load(path)?)
        }
        None => Ok(Config::default()),
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

/// Prints the violation report. Returns whether the source was clean.
fn check(file: &Path, role: Role, config: Option<&Path>) -> Result<bool> {
    let config = load_config(config)?;
    let source = read_source(file)?;
    let violations = match config.sandbox().validate(&source, role) {
        Ok(_) => Vec::new(),
        Err(violations) => violations,
    };
    let ok = violations.is_empty();
    let report = json!({
        "ok": ok,
        "origin": file.display().to_string(),
        "role": role.to_string(),
        "violations": violations,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ok)
}

async fn run(file: &Path, input: Option<&str>, config: Option<&Path>, tools: &[PathBuf]) -> Result<()> {
    let runtime = AgentRuntime::new(load_config(config)?);

    for path in tools {
        let origin = path.display().to_string();
        let names = runtime.load_tools(&read_source(path)?, &origin).await?;
        info!("Tools from {origin}: {}", names.join(", "));
    }

    let origin = file.display().to_string();
    let agent = runtime.load(&read_source(file)?, &origin).await?;
    let inputs: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        None => Value::Null,
    };

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Shutdown signal received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let outcome = runtime.run_with_cancel(&agent, inputs, cancel).await;
    watcher.abort();

    let outcome = outcome?;
    info!(
        "Run {} finished: {} task call(s) in {:?}",
        outcome.run_id,
        outcome.history.len(),
        outcome.duration
    );
    println!("{}", serde_json::to_string_pretty(&outcome.outputs)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else
    for arg in &args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("taskweave v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode). Logs go to stderr
    // so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskweave=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match parse_args(&args)? {
        Command::Check { file, role, config } => {
            if !check(&file, role, config.as_deref())? {
                std::process::exit(1);
            }
        }
        Command::Run {
            file,
            input,
            config,
            tools,
        } => run(&file, input.as_deref(), config.as_deref(), &tools).await?,
    }
    Ok(())
}
