//! Hub health command

use anyhow::Result;
use colored::Colorize;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, OutputFormat};

/// Converge the hub through the control plane and print the outcome.
/// Fails when the hub is unhealthy so scripts can branch on the exit code.
pub async fn show(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.hub_health().await?;

    match format {
        OutputFormat::Json => print_json(&health)?,
        OutputFormat::Table => {
            println!("{}", "Selenium Hub".bold());
            println!("Status:          {}", color_status(&health.status));
            println!("Deployment mode: {}", health.deployment_mode.cyan());
        }
    }

    if health.status != "healthy" {
        anyhow::bail!("Selenium Hub is {}", health.status);
    }
    Ok(())
}
