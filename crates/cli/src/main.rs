//! Selenium Hub control plane CLI
//!
//! Creates, lists and deletes browser workers and checks the hub through
//! the control plane's HTTP API.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{browsers, health};

/// Selenium Hub control plane CLI
#[derive(Parser)]
#[command(name = "hubctl")]
#[command(author, version, about = "CLI for the Selenium Hub control plane", long_about = None)]
pub struct Cli {
    /// Control plane URL (can also be set via HUBCTL_API_URL env var)
    #[arg(long, env = "HUBCTL_API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Bearer token for the API
    #[arg(long, env = "HUBCTL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage browser workers
    #[command(subcommand)]
    Browsers(BrowsersCommands),

    /// Check that the Selenium Hub is running
    Health,
}

#[derive(Subcommand)]
pub enum BrowsersCommands {
    /// Create browser workers
    Create {
        /// Browser type as configured on the server
        #[arg(long = "type", short, default_value = "chrome")]
        browser_type: String,

        /// Number of workers to create
        #[arg(long, short, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },

    /// Delete browser workers by id
    Delete {
        /// Worker ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List workers created through the control plane
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url, cli.token.clone())?;

    match cli.command {
        Commands::Browsers(cmd) => match cmd {
            BrowsersCommands::Create {
                browser_type,
                count,
            } => {
                browsers::create(&client, &browser_type, count, cli.format).await?;
            }
            BrowsersCommands::Delete { ids } => {
                browsers::delete(&client, &ids, cli.format).await?;
            }
            BrowsersCommands::List => {
                browsers::list(&client, cli.format).await?;
            }
        },
        Commands::Health => {
            health::show(&client, cli.format).await?;
        }
    }

    Ok(())
}
