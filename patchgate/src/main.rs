//! `patchgate` binary: serves the tool protocol over stdin/stdout.

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

use patchgate::core::naming::validate_tag;
use patchgate::dispatch::Dispatcher;
use patchgate::exit_codes;
use patchgate::io::config::load_with_env;
use patchgate::logging;
use patchgate::serve::serve;
use patchgate::tools::ToolCatalog;

#[derive(Parser)]
#[command(
    name = "patchgate",
    version,
    about = "Human-gated patch workflow for agent edits in a sandboxed directory"
)]
struct Cli {
    /// Config file (missing file means built-in defaults).
    #[arg(long, global = true, default_value = "patchgate.toml")]
    config: PathBuf,
    /// Tag appended to the run directory name (overrides config and environment).
    #[arg(long, global = true)]
    tag: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON requests from stdin, one per line, and answer on stdout.
    Serve,
    /// Print the tool catalog (names, descriptions, JSON-schema parameters).
    Tools,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::FATAL);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Tools => cmd_tools(),
        Command::Serve => cmd_serve(&cli.config, cli.tag),
    }
}

fn cmd_tools() -> Result<()> {
    let catalog = ToolCatalog::load()?;
    let mut payload = serde_json::to_string_pretty(catalog.specs()).context("serialize catalog")?;
    payload.push('\n');
    io::stdout()
        .write_all(payload.as_bytes())
        .context("write catalog")?;
    Ok(())
}

fn cmd_serve(config: &std::path::Path, tag: Option<String>) -> Result<()> {
    let (mut cfg, env) = load_with_env(config, |key| std::env::var(key).ok())?;
    if let Some(tag) = tag {
        validate_tag(&tag).map_err(|msg| anyhow!(msg))?;
        cfg.run_tag = Some(tag);
    }
    let mut dispatcher = Dispatcher::from_config(&cfg, env)?;
    info!(
        session = dispatcher.engine().session().id(),
        run_dir = %dispatcher.engine().session().dir().display(),
        "session ready"
    );
    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    let stats = serve(&mut dispatcher, stdin, stdout)?;
    info!(tool_calls = stats.tool_calls, approvals = stats.approvals, "run finished");
    Ok(())
}
