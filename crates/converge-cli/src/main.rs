mod api;
mod cli;
mod client;
mod commands;
mod logging;
mod output;
mod server;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use client::ConvergeClient;
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format)?;

    match &cli.command {
        Commands::Serve(args) => commands::serve::serve(args).await?,
        Commands::App(args) => {
            let client = ConvergeClient::new(&cli.server);
            commands::app::run(&client, &args.command, cli.format).await?;
        }
        Commands::Webhook(args) => {
            let client = ConvergeClient::new(&cli.server);
            commands::webhook::notify(&client, args, cli.format).await?;
        }
        Commands::Render(args) => commands::render::render(args, cli.format).await?,
        Commands::Status => {
            let client = ConvergeClient::new(&cli.server);
            let health = client.health().await?;
            if !output::print_structured(&health, cli.format)? {
                output::print_success(&format!(
                    "{} is {} (v{}, {} applications)",
                    cli.server, health.status, health.version, health.applications
                ));
            }
        }
    }
    Ok(())
}
