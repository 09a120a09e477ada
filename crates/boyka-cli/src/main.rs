mod commands;
mod configuration;
mod error;
mod render;

use anyhow::{Context, Result};
use boyka::agent::{Agent, ResponseMode};
use boyka::context::FileContext;
use boyka::session::{Session, SessionHandle};
use boyka::tools::{ProjectTools, ToolRegistry};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use configuration::{expand, Settings};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to <config dir>/boyka/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root the tools are confined to
    #[arg(short, long, global = true)]
    workspace: Option<String>,

    /// Stream responses as they are generated
    #[arg(long, global = true)]
    stream: bool,

    /// File to include as project context (repeatable)
    #[arg(long = "context-file", global = true)]
    context_files: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single message and exit
    Run {
        /// The message to send
        #[arg(short, long)]
        text: String,
    },

    /// Start an interactive session
    #[command(alias = "s")]
    Session,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("boyka=info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_session(cli: &Cli, settings: Settings) -> Result<SessionHandle> {
    let workspace = match &cli.workspace {
        Some(workspace) => expand(workspace),
        None => settings.workspace_path(),
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace {} is not accessible", workspace.display()))?;

    let mut registry = ToolRegistry::new();
    registry.register(ProjectTools::new(&workspace))?;

    let context_files = if cli.context_files.is_empty() {
        &settings.context_files
    } else {
        &cli.context_files
    };
    let context = FileContext::new(context_files.iter().map(|file| workspace.join(expand(file))));

    let mode = if cli.stream || settings.stream {
        ResponseMode::Streaming
    } else {
        ResponseMode::Batch
    };

    let provider_type = settings.backend.provider_type();
    let mut agent = Agent::from_config(settings.backend.into_config()?, Arc::new(registry))?
        .with_mode(mode)
        .with_context(Arc::new(context));

    if let Some(path) = &settings.system_prompt {
        let path = expand(path);
        let template = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read system prompt {}", path.display()))?;
        agent = agent.with_system_prompt(template)?;
    }

    tracing::info!(
        backend = %provider_type,
        workspace = %workspace.display(),
        ?mode,
        "session ready"
    );
    Ok(Session::new(agent).spawn())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            render::error(&e.to_string());
            std::process::exit(2);
        }
    };
    let handle = build_session(&cli, settings)?;

    match cli.command {
        Command::Run { text } => commands::run::execute(handle, text).await,
        Command::Session => commands::session::execute(handle).await,
    }
}
