//! Composable parts
//!
//! A [`PartDefinition`] describes one exported type found during discovery.
//! [`PartFactory::create_part`] turns it into a [`ComposablePart`]: parts
//! whose metadata asks for isolation get an [`IsolatingPart`] that activates
//! through the host registry; everything else is built in-process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use switchboard_common::{ActivatorError, EventRelay, RemoteActivator, TypeCatalog};

use super::error::ActivationError;
use super::host::RemoteHandler;
use super::registry::HostRegistry;
use crate::handlers::{Handler, LocalHandler};

/// Default settings base name for isolated parts.
pub const DEFAULT_CONFIG_BASE_NAME: &str = "domain";

// ─────────────────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Construct in the bus's own address space
    None,
    /// Construct inside an activation host
    #[default]
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationMetadata {
    pub level: IsolationLevel,
    pub config_base_name: String,
}

impl Default for IsolationMetadata {
    fn default() -> Self {
        Self {
            level: IsolationLevel::Isolated,
            config_base_name: DEFAULT_CONFIG_BASE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportDefinition {
    pub contract_name: String,
}

impl ExportDefinition {
    pub fn new(contract_name: impl Into<String>) -> Self {
        Self {
            contract_name: contract_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDefinition {
    pub type_name: String,
    /// Directory the part was discovered in
    pub origin: PathBuf,
    pub exports: Vec<ExportDefinition>,
    pub isolation: Option<IsolationMetadata>,
}

impl PartDefinition {
    /// Isolation metadata, if this part must be isolated.
    pub fn requires_isolation(&self) -> Option<&IsolationMetadata> {
        self.isolation
            .as_ref()
            .filter(|meta| meta.level != IsolationLevel::None)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Composable Parts
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ComposablePart: Send + Sync {
    fn definition(&self) -> &PartDefinition;

    /// The value behind `export`. Constructed on first request and memoized.
    async fn exported_value(
        &self,
        export: &ExportDefinition,
    ) -> Result<Arc<dyn Handler>, ActivationError>;

    /// Release every value this part handed out.
    async fn dispose(&self);
}

/// Builds parts from definitions.
#[derive(Clone)]
pub struct PartFactory {
    catalog: Arc<TypeCatalog>,
    registry: Arc<HostRegistry>,
    events: EventRelay,
}

impl PartFactory {
    pub fn new(catalog: Arc<TypeCatalog>, registry: Arc<HostRegistry>, events: EventRelay) -> Self {
        Self {
            catalog,
            registry,
            events,
        }
    }

    pub fn create_part(&self, definition: PartDefinition) -> Box<dyn ComposablePart> {
        match definition.requires_isolation().cloned() {
            Some(metadata) => Box::new(IsolatingPart {
                definition,
                metadata,
                registry: self.registry.clone(),
                values: Mutex::new(HashMap::new()),
            }),
            None => Box::new(LocalPart {
                definition,
                activator: RemoteActivator::new(self.catalog.clone()),
                events: self.events.clone(),
                values: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// A part constructed in-process.
pub struct LocalPart {
    definition: PartDefinition,
    activator: RemoteActivator,
    events: EventRelay,
    values: Mutex<HashMap<ExportDefinition, Arc<LocalHandler>>>,
}

#[async_trait]
impl ComposablePart for LocalPart {
    fn definition(&self) -> &PartDefinition {
        &self.definition
    }

    async fn exported_value(
        &self,
        export: &ExportDefinition,
    ) -> Result<Arc<dyn Handler>, ActivationError> {
        let mut values = self.values.lock().await;
        if let Some(value) = values.get(export) {
            let value: Arc<dyn Handler> = value.clone();
            return Ok(value);
        }

        let type_name = &self.definition.type_name;
        let instance = self
            .activator
            .create_instance_and_cast_to(type_name, Some(export.contract_name.as_str()))
            .map_err(|e| ActivationError::new(type_name.as_str(), e))?;
        let handler = instance.handler().ok_or_else(|| {
            ActivationError::new(
                type_name.as_str(),
                ActivatorError::CastFailed {
                    type_name: type_name.clone(),
                    contract: export.contract_name.clone(),
                },
            )
        })?;

        let value = Arc::new(LocalHandler::new(handler, self.events.clone()));
        values.insert(export.clone(), value.clone());
        let value: Arc<dyn Handler> = value;
        Ok(value)
    }

    async fn dispose(&self) {
        let values = std::mem::take(&mut *self.values.lock().await);
        debug!(part = %self.definition.type_name, "Disposed {} local value(s)", values.len());
    }
}

/// A part whose exports are activated inside an isolation host.
pub struct IsolatingPart {
    definition: PartDefinition,
    metadata: IsolationMetadata,
    registry: Arc<HostRegistry>,
    values: Mutex<HashMap<ExportDefinition, Arc<RemoteHandler>>>,
}

impl IsolatingPart {
    pub fn metadata(&self) -> &IsolationMetadata {
        &self.metadata
    }
}

#[async_trait]
impl ComposablePart for IsolatingPart {
    fn definition(&self) -> &PartDefinition {
        &self.definition
    }

    async fn exported_value(
        &self,
        export: &ExportDefinition,
    ) -> Result<Arc<dyn Handler>, ActivationError> {
        let mut values = self.values.lock().await;
        if let Some(value) = values.get(export) {
            let value: Arc<dyn Handler> = value.clone();
            return Ok(value);
        }

        let value = self
            .registry
            .activate(
                &self.definition.origin,
                &self.definition.type_name,
                &self.metadata.config_base_name,
                Some(export.contract_name.as_str()),
            )
            .await?;
        values.insert(export.clone(), value.clone());
        let value: Arc<dyn Handler> = value;
        Ok(value)
    }

    async fn dispose(&self) {
        let values = std::mem::take(&mut *self.values.lock().await);
        for value in values.values() {
            self.registry.release_instance(value.as_ref()).await;
        }
        debug!(part = %self.definition.type_name, "Released {} isolated value(s)", values.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{RegistrySettings, ThreadLauncher};
    use switchboard_common::{
        Disposition, Envelope, HandlerContext, HandlerError, MESSAGE_HANDLER_CONTRACT,
        MessageHandler,
    };

    #[derive(Default)]
    struct Noop;

    impl MessageHandler for Noop {
        fn handled_types(&self) -> &[&str] {
            &["Noop"]
        }

        fn process(&self, _: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
            Ok(Disposition::Completed)
        }
    }

    fn factory() -> (PartFactory, Arc<HostRegistry>) {
        let mut catalog = TypeCatalog::new();
        catalog.register_handler::<Noop>();
        let catalog = Arc::new(catalog);
        let events = EventRelay::default();
        let registry = HostRegistry::new(
            Arc::new(ThreadLauncher::new(catalog.clone())),
            RegistrySettings::default(),
            events.clone(),
        );
        (PartFactory::new(catalog, registry.clone(), events), registry)
    }

    fn definition(level: Option<IsolationLevel>) -> PartDefinition {
        PartDefinition {
            type_name: std::any::type_name::<Noop>().to_string(),
            origin: PathBuf::from("/plugins/noop"),
            exports: vec![ExportDefinition::new(MESSAGE_HANDLER_CONTRACT)],
            isolation: level.map(|level| IsolationMetadata {
                level,
                ..IsolationMetadata::default()
            }),
        }
    }

    #[test]
    fn test_requires_isolation() {
        assert!(definition(None).requires_isolation().is_none());
        assert!(definition(Some(IsolationLevel::None)).requires_isolation().is_none());
        let isolated = definition(Some(IsolationLevel::Isolated));
        assert_eq!(
            isolated.requires_isolation().unwrap().config_base_name,
            DEFAULT_CONFIG_BASE_NAME
        );
    }

    #[tokio::test]
    async fn test_local_part_memoizes_export() {
        let (factory, registry) = factory();
        let part = factory.create_part(definition(None));
        let export = &part.definition().exports[0].clone();

        let a = part.exported_value(export).await.unwrap();
        let b = part.exported_value(export).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.hosts().is_empty(), "local parts never create hosts");
        part.dispose().await;
    }

    #[tokio::test]
    async fn test_isolating_part_activates_once_and_releases() {
        let (factory, registry) = factory();
        let part = factory.create_part(definition(Some(IsolationLevel::Isolated)));
        let export = part.definition().exports[0].clone();

        let a = part.exported_value(&export).await.unwrap();
        let b = part.exported_value(&export).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let hosts = registry.hosts();
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].has_activated(std::any::type_name::<Noop>()));

        part.dispose().await;
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_type_is_wrapped() {
        let (factory, registry) = factory();
        let mut def = definition(Some(IsolationLevel::Isolated));
        def.type_name = "missing::Type".into();
        let part = factory.create_part(def);

        let export = part.definition().exports[0].clone();
        let err = part.exported_value(&export).await.err().unwrap();
        assert_eq!(err.type_name, "missing::Type");
        assert!(err.to_string().starts_with("Unable to activate instance of missing::Type"));
        registry.shutdown().await;
    }
}
