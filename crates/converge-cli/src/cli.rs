use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "GitOps controller: keeps runtime state converged on what git declares")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Control API base URL used by client commands
    #[arg(short, long, global = true, env = "CONVERGE_URL", default_value = "http://127.0.0.1:7420")]
    pub server: String,

    /// Log filter, e.g. `info` or `converge=debug` (RUST_LOG wins when set)
    #[arg(long, global = true, env = "CONVERGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "CONVERGE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Output format for command results
    #[arg(short, long, global = true, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum, Default, PartialEq, Eq, Debug)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum, Default, PartialEq, Eq, Debug)]
pub enum OutputFormat {
    Json,
    Yaml,
    #[default]
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller and its control API
    Serve(ServeArgs),
    /// Manage applications on a running controller
    App(AppArgs),
    /// Notify the controller of a push to a repository
    Webhook(WebhookArgs),
    /// Render a local manifest directory without contacting a controller
    Render(RenderArgs),
    /// Check that the controller is up
    Status,
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Directory holding settings and application resources
    #[arg(short, long, env = "CONVERGE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Address to listen on (overrides settings)
    #[arg(long, env = "CONVERGE_LISTEN_ADDR")]
    pub listen: Option<String>,

    /// Registry database file (overrides settings)
    #[arg(long, env = "CONVERGE_DATABASE")]
    pub database: Option<String>,

    /// Seconds to wait for in-flight syncs on shutdown
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace: u64,
}

#[derive(clap::Args)]
pub struct AppArgs {
    #[command(subcommand)]
    pub command: AppCommands,
}

#[derive(Subcommand)]
pub enum AppCommands {
    /// List registered applications
    List,
    /// Show one application's status
    Get {
        name: String,
    },
    /// Register an application from an Application resource file
    Register {
        /// YAML file with `kind: Application`
        file: PathBuf,
    },
    /// Remove an application
    Deregister {
        name: String,
        /// Also delete every resource the application manages
        #[arg(long)]
        prune: bool,
    },
    /// Sync an application to the head of its ref now
    Sync {
        name: String,
    },
    /// Override parts of an application's sync policy
    Policy(PolicyArgs),
    /// Show recent sync operations
    History {
        name: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(clap::Args)]
pub struct PolicyArgs {
    pub name: String,
    #[arg(long)]
    pub automated: Option<bool>,
    #[arg(long)]
    pub prune: Option<bool>,
    #[arg(long)]
    pub self_heal: Option<bool>,
}

#[derive(clap::Args)]
pub struct WebhookArgs {
    /// Repository URL as registered in applications
    pub repo_url: String,
    /// Branch or tag that moved
    #[arg(short, long, default_value = "main")]
    pub reference: String,
}

#[derive(clap::Args)]
pub struct RenderArgs {
    /// Working copy to render from
    pub dir: PathBuf,
    /// Path inside the working copy to render
    #[arg(short, long, default_value = ".")]
    pub path: String,
    /// Namespace given to resources that declare none
    #[arg(short, long, default_value = "default")]
    pub namespace: String,
    /// Application name used for `${APP}`
    #[arg(long, default_value = "local")]
    pub app: String,
}
