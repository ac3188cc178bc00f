use anyhow::Result;
use colored::Colorize;

use crate::cli::{OutputFormat, WebhookArgs};
use crate::client::ConvergeClient;
use crate::output::{print_structured, print_success};

pub async fn notify(client: &ConvergeClient, args: &WebhookArgs, format: OutputFormat) -> Result<()> {
    let response = client.webhook(&args.repo_url, &args.reference).await?;
    if print_structured(&response, format)? {
        return Ok(());
    }
    if response.matched.is_empty() {
        println!(
            "No application tracks {}@{}",
            args.repo_url, args.reference
        );
    } else {
        print_success(&format!(
            "Woke {}",
            response
                .matched
                .iter()
                .map(|name| name.cyan().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    Ok(())
}
