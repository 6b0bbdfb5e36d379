//! Plugin Discovery
//!
//! Scans the handler directory for plugins and composes them into handlers.
//!
//! Each immediate subdirectory holding a `switchboard-plugin.toml` manifest is
//! one plugin origin. The manifest lists the handler types the plugin exports
//! and how each must be isolated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use switchboard_common::MESSAGE_HANDLER_CONTRACT;

use crate::handlers::Handler;
use crate::isolation::{
    ComposablePart, DEFAULT_CONFIG_BASE_NAME, ExportDefinition, IsolationLevel, IsolationMetadata,
    PartDefinition, PartFactory,
};

/// Manifest file name inside each plugin directory.
pub const MANIFEST_FILE: &str = "switchboard-plugin.toml";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Plugin manifest exports no handlers")]
    NoHandlers,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manifest
// ─────────────────────────────────────────────────────────────────────────────

/// Plugin manifest (switchboard-plugin.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginInfo,
    #[serde(default)]
    pub handlers: Vec<HandlerExport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub description: Option<String>,
}

/// One exported handler type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerExport {
    pub type_name: String,
    #[serde(default = "default_contract")]
    pub contract: String,
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[serde(default = "default_config_base_name")]
    pub config_base_name: String,
}

fn default_contract() -> String {
    MESSAGE_HANDLER_CONTRACT.to_string()
}

fn default_config_base_name() -> String {
    DEFAULT_CONFIG_BASE_NAME.to_string()
}

/// A plugin found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Plugin directory; also the working directory of its host
    pub origin: PathBuf,
    pub manifest: PluginManifest,
}

impl DiscoveredPlugin {
    /// One part definition per exported handler.
    pub fn part_definitions(&self) -> Vec<PartDefinition> {
        self.manifest
            .handlers
            .iter()
            .map(|export| PartDefinition {
                type_name: export.type_name.clone(),
                origin: self.origin.clone(),
                exports: vec![ExportDefinition::new(export.contract.clone())],
                isolation: Some(IsolationMetadata {
                    level: export.isolation,
                    config_base_name: export.config_base_name.clone(),
                }),
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// Find every plugin under `handler_path`.
///
/// A missing directory yields no plugins. Unreadable manifests are logged
/// and skipped.
pub async fn discover_plugins(handler_path: &Path) -> Result<Vec<DiscoveredPlugin>, DiscoveryError> {
    let mut plugins = Vec::new();

    if !handler_path.exists() {
        warn!("Handler directory not found: {}", handler_path.display());
        return Ok(plugins);
    }

    let mut entries = fs::read_dir(handler_path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            debug!("Skipping {} (no manifest)", path.display());
            continue;
        }

        match load_manifest(&manifest_path).await {
            Ok(manifest) => {
                debug!(
                    "Discovered plugin: {} ({} handler(s))",
                    manifest.plugin.id,
                    manifest.handlers.len()
                );
                plugins.push(DiscoveredPlugin {
                    origin: path,
                    manifest,
                });
            }
            Err(e) => {
                warn!("Failed to load plugin from {}: {}", path.display(), e);
            }
        }
    }

    // Directory order is platform dependent
    plugins.sort_by(|a, b| a.origin.cmp(&b.origin));
    info!("Discovered {} plugin(s) in {}", plugins.len(), handler_path.display());
    Ok(plugins)
}

async fn load_manifest(path: &Path) -> Result<PluginManifest, DiscoveryError> {
    let content = fs::read_to_string(path).await?;
    let manifest: PluginManifest = toml::from_str(&content)?;
    if manifest.handlers.is_empty() {
        return Err(DiscoveryError::NoHandlers);
    }
    Ok(manifest)
}

// ─────────────────────────────────────────────────────────────────────────────
// Composition
// ─────────────────────────────────────────────────────────────────────────────

/// Parts created during composition and the handlers they exported.
#[derive(Default)]
pub struct Composition {
    pub parts: Vec<Box<dyn ComposablePart>>,
    pub handlers: Vec<Arc<dyn Handler>>,
}

impl Composition {
    /// Release everything the parts handed out.
    pub async fn dispose(self) {
        for part in self.parts {
            part.dispose().await;
        }
    }
}

/// Create a part per definition and activate every export.
///
/// Activation failures are logged and the export is skipped; the remaining
/// handlers still compose.
pub async fn compose(definitions: Vec<PartDefinition>, factory: &PartFactory) -> Composition {
    let mut composition = Composition::default();

    for definition in definitions {
        let part = factory.create_part(definition);
        for export in part.definition().exports.clone() {
            match part.exported_value(&export).await {
                Ok(handler) => {
                    debug!(
                        handler = %handler.type_name(),
                        contract = %export.contract_name,
                        "Composed handler"
                    );
                    composition.handlers.push(handler);
                }
                Err(e) => warn!("{}", e),
            }
        }
        composition.parts.push(part);
    }

    info!("Composed {} handler(s)", composition.handlers.len());
    composition
}
