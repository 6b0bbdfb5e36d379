//! Switchboard Plugin Host
//!
//! Usage: `switchboard-plugin-host [--config-base <name>]`
//!
//! Runs in the plugin's directory. Settings are read from
//! `<config base name>.toml` in the working directory, stdout carries IPC
//! frames and logs go to stderr.

use std::env;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use switchboard_common::RemoteActivator;
use switchboard_common::boundary::{ConfigureHook, load_host_settings, serve_stdio};

const DEFAULT_CONFIG_BASE: &str = "domain";

fn parse_config_base(args: &[String]) -> Result<String> {
    let mut config_base = DEFAULT_CONFIG_BASE.to_string();
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-base" => {
                config_base = args
                    .next()
                    .cloned()
                    .context("--config-base needs a value")?;
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(config_base)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is for IPC)
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config_base = match parse_config_base(&args) {
        Ok(config_base) => config_base,
        Err(e) => {
            error!("{}. Usage: switchboard-plugin-host [--config-base <name>]", e);
            std::process::exit(2);
        }
    };

    let working_dir = env::current_dir().context("failed to read working directory")?;
    info!(
        "Plugin host starting in {} (settings: {}.toml)",
        working_dir.display(),
        config_base
    );

    let settings = load_host_settings(&working_dir, &config_base).await;
    let activator = RemoteActivator::new(Arc::new(switchboard_plugin_host::catalog()))
        .with_hook(Arc::new(ConfigureHook::new(settings)));

    serve_stdio(activator).await?;
    info!("Plugin host exiting");
    Ok(())
}
