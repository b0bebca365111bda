//! Reflective data-fetch controller CLI.
//!
//! Loads `fetcher.toml`, wires the chat client, the process sandbox and the
//! agent log into a controller, and runs one session per invocation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use fetcher::core::budget::{CancelToken, Deadline};
use fetcher::exit_codes;
use fetcher::io::clock::SystemClock;
use fetcher::io::config::{DEFAULT_CONFIG_FILE, FetchConfig, load_config, write_config};
use fetcher::io::log_sink::{FileLogSink, LogSink, TracingLogSink};
use fetcher::io::model::OpenAiChatClient;
use fetcher::io::retry::{RetryPolicy, RetryingModel};
use fetcher::io::sandbox::{ProcessSandbox, Sandbox};
use fetcher::logging;
use fetcher::{FetchRequest, Outcome, ReflectiveFetchController};

#[derive(Parser)]
#[command(
    name = "fetcher",
    version,
    about = "Turn a data request into validated, executed code"
)]
struct Cli {
    /// Config file; missing files fall back to defaults.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one fetch session and print the result as JSON.
    Run {
        /// The question as the user asked it.
        #[arg(short, long)]
        query: String,
        /// Concrete data need; defaults to the query.
        #[arg(short, long)]
        rewrite: Option<String>,
        /// File with API documentation for the code author and the critic.
        #[arg(short, long)]
        docs: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Run a Python file through the configured sandbox and print the outcome.
    Exec { file: PathBuf },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            query,
            rewrite,
            docs,
            max_iterations,
            max_retries,
        } => {
            let cfg = load_config(&cli.config)?;
            let doc_snippet = match docs {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("read docs {}", path.display()))?,
                None => String::new(),
            };
            let request = FetchRequest::new(
                query.clone(),
                rewrite.unwrap_or(query),
                doc_snippet,
                max_iterations.unwrap_or(cfg.controller.max_iterations),
                max_retries.unwrap_or(cfg.controller.max_retries),
            );
            cmd_run(&cfg, &request)
        }
        Command::Exec { file } => {
            let cfg = load_config(&cli.config)?;
            cmd_exec(&cfg, &file)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &FetchConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &FetchConfig, request: &FetchRequest) -> Result<i32> {
    let client = OpenAiChatClient::from_env(&cfg.model)?;
    let model = RetryingModel::new(client, RetryPolicy::from(&cfg.retry));
    let sandbox = ProcessSandbox::new(cfg.sandbox.clone());
    let clock = SystemClock;
    let log: Box<dyn LogSink> = match &cfg.log.file {
        Some(path) => Box::new(FileLogSink::open(
            path,
            cfg.log.max_lines,
            Arc::new(SystemClock),
        )?),
        None => Box::new(TracingLogSink),
    };

    let controller = ReflectiveFetchController::new(&model, &sandbox, log.as_ref(), &clock, cfg);
    let result = controller.run(request)?;
    print_json(&result)?;
    Ok(exit_codes::for_status(result.status))
}

fn cmd_exec(cfg: &FetchConfig, file: &Path) -> Result<i32> {
    let code = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let sandbox = ProcessSandbox::new(cfg.sandbox.clone());
    let deadline = Deadline::after(cfg.sandbox.timeout(), CancelToken::new());
    let outcome = sandbox.execute(&code, &deadline);
    print_json(&outcome)?;
    Ok(match outcome {
        Outcome::Value { .. } => exit_codes::OK,
        Outcome::Failure { .. } => exit_codes::ERROR,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
