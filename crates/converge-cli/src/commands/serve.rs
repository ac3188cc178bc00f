use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use converge::config::{default_config_dir, ConfigLoader, LoadedConfig, SettingsResource};
use converge::ControlPlane;

use crate::cli::ServeArgs;
use crate::server::{router, shutdown_signal};

fn load_config(config_dir: Option<&PathBuf>) -> Result<LoadedConfig> {
    let dir = match config_dir {
        Some(dir) => dir.clone(),
        None => match default_config_dir().filter(|dir| dir.is_dir()) {
            Some(dir) => dir,
            None => {
                log::info!("No config directory found, using default settings");
                return Ok(LoadedConfig {
                    settings: SettingsResource::default(),
                    settings_path: None,
                    applications: Vec::new(),
                });
            }
        },
    };
    ConfigLoader::new(&dir)
        .load()
        .with_context(|| format!("Failed to load config from {}", dir.display()))
}

/// Runs the controller until SIGINT or SIGTERM.
pub async fn serve(args: &ServeArgs) -> Result<()> {
    let config = load_config(args.config_dir.as_ref())?;
    let mut settings = config.settings.spec;
    if let Some(listen) = &args.listen {
        settings.listen_addr = listen.clone();
    }
    if let Some(database) = &args.database {
        settings.database_path = database.clone();
    }

    let control = Arc::new(ControlPlane::from_settings(&settings)?);
    control.controller().start()?;
    for resource in config.applications {
        let name = resource.resource.metadata.name.clone();
        control
            .apply(&name, resource.resource.spec)
            .await
            .with_context(|| format!("Failed to apply {}", resource.path.display()))?;
    }

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;
    log::info!("Control API listening on http://{}", settings.listen_addr);

    axum::serve(listener, router(control.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    control
        .shutdown(Duration::from_secs(args.shutdown_grace))
        .await;
    log::info!("Controller stopped");
    Ok(())
}
