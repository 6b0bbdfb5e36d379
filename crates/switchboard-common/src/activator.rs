//! Boundary-side activation
//!
//! Code running inside an isolation boundary cannot load arbitrary types by
//! name, so every boundary carries a [`TypeCatalog`]: a table from type name
//! to constructor. The [`RemoteActivator`] builds instances from that table,
//! optionally narrows them to a single contract, and runs post-construction
//! hooks before anything is handed back across the boundary.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::handler::{MESSAGE_HANDLER_CONTRACT, MessageHandler};

// ─────────────────────────────────────────────────────────────────────────────
// Activator Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ActivatorError {
    #[error("Type '{0}' is not registered in this boundary")]
    UnknownType(String),

    #[error("Construction of '{type_name}' failed: {reason}")]
    ConstructionFailed { type_name: String, reason: String },

    #[error("Type '{type_name}' does not implement contract '{contract}'")]
    CastFailed { type_name: String, contract: String },

    #[error("Post-construction hook failed for '{type_name}': {reason}")]
    HookFailed { type_name: String, reason: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Instances
// ─────────────────────────────────────────────────────────────────────────────

/// A reference to an instance through one of its contracts.
#[derive(Clone)]
pub enum ContractRef {
    MessageHandler(Arc<dyn MessageHandler>),
}

impl ContractRef {
    pub fn contract_name(&self) -> &'static str {
        match self {
            ContractRef::MessageHandler(_) => MESSAGE_HANDLER_CONTRACT,
        }
    }
}

/// A constructed instance plus the contracts it can be used through.
///
/// After [`Instance::narrow`] only the requested contract remains and the
/// concrete value is no longer reachable.
#[derive(Clone)]
pub struct Instance {
    type_name: String,
    concrete: Option<Arc<dyn Any + Send + Sync>>,
    contracts: Vec<ContractRef>,
}

impl Instance {
    pub fn new<T>(type_name: impl Into<String>, concrete: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        let concrete: Arc<dyn Any + Send + Sync> = concrete;
        Self {
            type_name: type_name.into(),
            concrete: Some(concrete),
            contracts: Vec::new(),
        }
    }

    pub fn with_contract(mut self, contract: ContractRef) -> Self {
        self.contracts.push(contract);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn contracts(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.contracts.iter().map(ContractRef::contract_name)
    }

    pub fn contract(&self, name: &str) -> Option<&ContractRef> {
        self.contracts.iter().find(|c| c.contract_name() == name)
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.contracts.iter().find_map(|c| match c {
            ContractRef::MessageHandler(h) => Some(h.clone()),
        })
    }

    /// The concrete value, if the instance has not been narrowed.
    pub fn downcast<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.concrete.clone()?.downcast::<T>().ok()
    }

    pub fn is_narrowed(&self) -> bool {
        self.concrete.is_none()
    }

    /// Keep only `contract`.
    pub fn narrow(self, contract: &str) -> Result<Instance, ActivatorError> {
        let Some(found) = self.contract(contract).cloned() else {
            return Err(ActivatorError::CastFailed {
                type_name: self.type_name,
                contract: contract.to_string(),
            });
        };
        Ok(Instance {
            type_name: self.type_name,
            concrete: None,
            contracts: vec![found],
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type Catalog
// ─────────────────────────────────────────────────────────────────────────────

type Factory = Arc<dyn Fn() -> Result<Instance, String> + Send + Sync>;

/// Constructors a boundary knows how to run, keyed by type name.
#[derive(Clone, Default)]
pub struct TypeCatalog {
    factories: HashMap<String, Factory>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `type_name`. Replaces any earlier entry.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Instance, String> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    /// Register a default-constructible handler under its Rust type path.
    pub fn register_handler<H>(&mut self) -> &mut Self
    where
        H: MessageHandler + Default,
    {
        let type_name = std::any::type_name::<H>();
        self.register(type_name, move || {
            let handler = Arc::new(H::default());
            Ok(Instance::new(type_name, handler.clone())
                .with_contract(ContractRef::MessageHandler(handler)))
        })
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn factory(&self, type_name: &str) -> Option<Factory> {
        self.factories.get(type_name).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Activator
// ─────────────────────────────────────────────────────────────────────────────

/// Runs after construction and narrowing, before the instance is returned.
pub trait ActivationHook: Send + Sync {
    fn after_create(&self, instance: &Instance) -> Result<(), String>;
}

/// Creates instances from a [`TypeCatalog`].
#[derive(Clone)]
pub struct RemoteActivator {
    catalog: Arc<TypeCatalog>,
    hooks: Vec<Arc<dyn ActivationHook>>,
}

impl RemoteActivator {
    pub fn new(catalog: Arc<TypeCatalog>) -> Self {
        Self {
            catalog,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ActivationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Construct `implementation_type_name` and, when `contract_type_name` is
    /// given, narrow the result to that contract.
    ///
    /// A panicking constructor is reported as a construction failure.
    pub fn create_instance_and_cast_to(
        &self,
        implementation_type_name: &str,
        contract_type_name: Option<&str>,
    ) -> Result<Instance, ActivatorError> {
        let factory = self
            .catalog
            .factory(implementation_type_name)
            .ok_or_else(|| ActivatorError::UnknownType(implementation_type_name.to_string()))?;

        let constructed = panic::catch_unwind(AssertUnwindSafe(|| factory()))
            .map_err(|payload| panic_message(payload.as_ref()))
            .and_then(|result| result);
        let instance = constructed.map_err(|reason| ActivatorError::ConstructionFailed {
            type_name: implementation_type_name.to_string(),
            reason,
        })?;

        let instance = match contract_type_name.filter(|c| !c.is_empty()) {
            Some(contract) => instance.narrow(contract)?,
            None => instance,
        };

        for hook in &self.hooks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook.after_create(&instance)))
                .map_err(|payload| panic_message(payload.as_ref()))
                .and_then(|result| result);
            if let Err(reason) = outcome {
                return Err(ActivatorError::HookFailed {
                    type_name: implementation_type_name.to_string(),
                    reason,
                });
            }
        }

        debug!(type_name = implementation_type_name, "Activated instance");
        Ok(instance)
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
