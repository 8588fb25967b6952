//! Browser worker commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{
    ApiClient, BrowserInstance, CreateBrowsersRequest, CreateBrowsersResponse,
    DeleteBrowserResponse, DeleteBrowsersRequest, DeleteBrowsersResponse,
};
use crate::output::{
    color_status, print_error, print_info, print_json, print_rows, print_success, print_warning,
    OutputFormat,
};

#[derive(Tabled)]
struct BrowserRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    browser_type: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "CPU")]
    cpu: String,
}

impl From<&BrowserInstance> for BrowserRow {
    fn from(b: &BrowserInstance) -> Self {
        Self {
            id: b.id.clone(),
            browser_type: b.browser_type.clone(),
            memory: b.resources.memory.clone(),
            cpu: b.resources.cpu.clone(),
        }
    }
}

fn rows(browsers: &[BrowserInstance]) -> Vec<BrowserRow> {
    browsers.iter().map(BrowserRow::from).collect()
}

pub async fn create(
    client: &ApiClient,
    browser_type: &str,
    count: u32,
    format: OutputFormat,
) -> Result<()> {
    let request = CreateBrowsersRequest {
        count,
        browser_type: browser_type.to_string(),
    };
    let result: CreateBrowsersResponse = client.post("api/v1/browsers/create", &request).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            let created = result.browsers.len();
            if created == count as usize {
                print_success(&format!("Created {} {} browser(s)", created, browser_type));
            } else {
                print_warning(&format!(
                    "Created {} of {} requested {} browser(s)",
                    created, count, browser_type
                ));
            }
            println!("Hub URL: {}", result.hub_url.cyan());
            println!();
            print_rows(&rows(&result.browsers), &result.browsers, format)?;
        }
    }

    Ok(())
}

/// One id goes through the single-delete route, several through bulk delete
pub async fn delete(client: &ApiClient, ids: &[String], format: OutputFormat) -> Result<()> {
    if let [id] = ids {
        let result: DeleteBrowserResponse =
            client.delete(&format!("api/v1/browsers/{}", id)).await?;
        match format {
            OutputFormat::Json => print_json(&result)?,
            OutputFormat::Table if result.success => print_success(&result.message),
            OutputFormat::Table => print_error(&format!("{}: {}", id, result.message)),
        }
        return Ok(());
    }

    let request = DeleteBrowsersRequest {
        browsers_ids: ids.to_vec(),
    };
    let result: DeleteBrowsersResponse = client.post("api/v1/browsers/delete", &request).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            println!(
                "Status: {} ({} of {} deleted)",
                color_status(&result.status),
                result.browsers_ids.len(),
                ids.len()
            );
            for id in &result.browsers_ids {
                print_success(id);
            }
            for id in ids.iter().filter(|id| !result.browsers_ids.contains(id)) {
                print_error(&format!("{} was not deleted", id));
            }
        }
    }

    Ok(())
}

pub async fn list(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let browsers: Vec<BrowserInstance> = client.get("api/v1/browsers").await?;

    if matches!(format, OutputFormat::Table) {
        print_info(&format!("{} browser(s) registered", browsers.len()));
    }
    print_rows(&rows(&browsers), &browsers, format)
}
