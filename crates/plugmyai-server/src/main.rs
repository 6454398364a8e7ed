use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use plugmyai_core::Config;
use plugmyai_core::config::default_data_dir;
use plugmyai_server::{ApprovalSurface, BrowserApproval, LogOnlyApproval};

/// Local gateway that lets paired apps use your AI subscriptions.
#[derive(Parser, Debug)]
#[command(name = "plug-my-ai", version)]
struct Cli {
    /// Directory holding config.toml and the database.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Log pairing requests instead of opening a browser.
    #[arg(long)]
    headless: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default configuration if missing and print the admin token.
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let dir = cli.config_dir.unwrap_or_else(default_data_dir);
    let mut cfg = Config::load(&dir)?;

    if let Some(Command::Init) = cli.command {
        println!("config: {}", cfg.path().display());
        println!("port: {}", cfg.port);
        println!("admin token: {}", cfg.admin_token);
        return Ok(());
    }

    if let Some(port) = cli.port {
        cfg.port = port;
    }
    let surface: Arc<dyn ApprovalSurface> = if cli.headless {
        Arc::new(LogOnlyApproval)
    } else {
        Arc::new(BrowserApproval)
    };
    let (_addr, handle) = plugmyai_server::start(cfg, surface).await?;
    tokio::select! {
        res = handle => res?,
        res = tokio::signal::ctrl_c() => res?,
    }
    Ok(())
}
