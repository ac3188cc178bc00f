use std::fs;

use anyhow::{Context, Result};
use colored::Colorize;

use converge::config::{parse_resource, AnyResource};
use converge::{PolicyOverride, SyncRequestOutcome};

use crate::cli::{AppCommands, OutputFormat, PolicyArgs};
use crate::client::ConvergeClient;
use crate::output::{
    print_application, print_applications, print_history, print_operation, print_structured,
    print_success,
};

pub async fn run(client: &ConvergeClient, command: &AppCommands, format: OutputFormat) -> Result<()> {
    match command {
        AppCommands::List => {
            let apps = client.list().await?;
            if !print_structured(&apps, format)? {
                print_applications(&apps);
            }
        }
        AppCommands::Get { name } => {
            let app = client.get(name).await?;
            if !print_structured(&app, format)? {
                print_application(&app);
            }
        }
        AppCommands::Register { file } => {
            let content = fs::read_to_string(file)
                .with_context(|| format!("Failed to read file: {}", file.display()))?;
            let resource = match parse_resource(&content, file)? {
                AnyResource::Application(resource) => resource,
                AnyResource::Settings(_) => {
                    anyhow::bail!("{} holds settings, not an Application", file.display())
                }
            };
            let app = client
                .register(&resource.metadata.name, resource.spec)
                .await?;
            print_success(&format!("Registered {}", app.name.cyan()));
            print_structured(&app, format)?;
        }
        AppCommands::Deregister { name, prune } => {
            let response = client.deregister(name, *prune).await?;
            if print_structured(&response, format)? {
                return Ok(());
            }
            print_success(&format!("Deregistered {}", name.cyan()));
            match &response.pruned {
                Some(op) => print_operation(op),
                None => println!("Managed resources were left in place."),
            }
        }
        AppCommands::Sync { name } => {
            let outcome = client.sync(name).await?;
            if print_structured(&outcome, format)? {
                return Ok(());
            }
            match &outcome {
                SyncRequestOutcome::Completed(op) => print_operation(op),
                SyncRequestOutcome::Coalesced { revision } => {
                    println!("A sync to {} is already running", revision)
                }
                SyncRequestOutcome::Queued { revision } => {
                    println!("Sync to {} queued behind the running one", revision)
                }
            }
        }
        AppCommands::Policy(args) => set_policy(client, args, format).await?,
        AppCommands::History { name, limit } => {
            let history = client.history(name, *limit).await?;
            if !print_structured(&history, format)? {
                print_history(&history);
            }
        }
    }
    Ok(())
}

async fn set_policy(client: &ConvergeClient, args: &PolicyArgs, format: OutputFormat) -> Result<()> {
    let policy = PolicyOverride {
        automated: args.automated,
        prune: args.prune,
        self_heal: args.self_heal,
    };
    if policy == PolicyOverride::default() {
        anyhow::bail!("Nothing to change. Pass --automated, --prune or --self-heal");
    }
    let app = client.set_policy(&args.name, &policy).await?;
    if print_structured(&app, format)? {
        return Ok(());
    }
    let p = app.spec.sync_policy;
    print_success(&format!(
        "{}: automated={} prune={} selfHeal={}",
        app.name.cyan(),
        p.automated,
        p.prune,
        p.self_heal
    ));
    Ok(())
}
