use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ghosts_agent::agent::Agent;
use ghosts_agent::comms::MachineIdentity;
use ghosts_agent::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use ghosts_agent::logging;

/// GHOSTS endpoint agent: runs the timeline and reports results.
#[derive(Parser, Debug)]
#[command(name = "ghosts-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(value_name = "CONFIG", env = "GHOSTS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print this machine's identity as JSON and exit
    #[arg(long)]
    information: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::load(&cli.config)
        .and_then(AgentConfig::apply_env)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    if cli.information {
        let identity = MachineIdentity::detect(config.id_file());
        println!("{}", serde_json::to_string_pretty(&identity.summary())?);
        return Ok(());
    }

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let default_filter = if cli.debug { "debug" } else { logging::DEFAULT_FILTER };
    let guard = logging::init(&config.log_directory, default_filter);

    eprintln!("👻 GHOSTS agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", cli.config.display());
    eprintln!("   Timeline: {}", config.timeline.location.display());
    eprintln!("   Control plane: {}", config.api_root_url);
    if config.listener.port != 0 {
        eprintln!("   Listener port: {}", config.listener.port);
    }
    if cli.debug {
        eprintln!("   Debug logging enabled");
    }

    tracing::info!(
        config = %cli.config.display(),
        timeline = %config.timeline.location.display(),
        "Starting agent"
    );

    let agent = Agent::start(config).await.context("starting agent")?;
    agent.run().await?;

    // Flush the log writer before the hard exit.
    drop(guard);
    std::process::exit(0);
}
