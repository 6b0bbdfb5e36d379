//! Lifecycle control
//!
//! Long-lived components (activation hosts, the bus itself) move through a
//! shared set of states. A [`Controller`] owns the state, serializes
//! transitions, and drives the component's [`Lifecycle`] hooks in order:
//!
//! ```text
//! start:  before_start (veto) -> Starting -> on_start -> Running -> after_start
//! stop:   before_stop  (veto) -> Stopping -> on_stop  -> Stopped -> after_stop
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Control State
// ─────────────────────────────────────────────────────────────────────────────

/// Current state of a controlled component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlState {
    Unloaded = 0,
    Loading = 1,
    Loaded = 2,
    Stopped = 3,
    Starting = 4,
    Running = 5,
    Stopping = 6,
    Unloading = 7,
}

impl ControlState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unloaded,
            1 => Self::Loading,
            2 => Self::Loaded,
            3 => Self::Stopped,
            4 => Self::Starting,
            5 => Self::Running,
            6 => Self::Stopping,
            _ => Self::Unloading,
        }
    }

    /// Starting or Running
    pub fn is_active(&self) -> bool {
        matches!(self, ControlState::Starting | ControlState::Running)
    }

    pub fn is_running(&self) -> bool {
        *self == ControlState::Running
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlState::Unloaded => "unloaded",
            ControlState::Loading => "loading",
            ControlState::Loaded => "loaded",
            ControlState::Stopped => "stopped",
            ControlState::Starting => "starting",
            ControlState::Running => "running",
            ControlState::Stopping => "stopping",
            ControlState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ControlState,
    pub current: ControlState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("Start failed: {0}")]
    StartFailed(String),

    #[error("Stop failed: {0}")]
    StopFailed(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle Hooks
// ─────────────────────────────────────────────────────────────────────────────

/// Hooks a [`Controller`] runs around start and stop.
///
/// `before_*` hooks may veto the transition by returning `false`; the state
/// is then left untouched.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn before_start(&self) -> bool {
        true
    }

    async fn on_start(&self) -> Result<(), LifecycleError>;

    async fn after_start(&self) {}

    async fn before_stop(&self) -> bool {
        true
    }

    async fn on_stop(&self) -> Result<(), LifecycleError>;

    async fn after_stop(&self) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Owns a component's state and runs its transitions one at a time.
pub struct Controller {
    name: String,
    state: AtomicU8,
    gate: Mutex<()>,
    changes: broadcast::Sender<StateChange>,
}

impl Controller {
    /// A controller for a loaded component that has never been started.
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            state: AtomicU8::new(ControlState::Loaded as u8),
            gate: Mutex::new(()),
            changes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    pub fn state(&self) -> ControlState {
        ControlState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Wait until no transition is in progress.
    pub async fn settled(&self) -> ControlState {
        let _gate = self.gate.lock().await;
        self.state()
    }

    /// Start the component. A component that is already starting or running
    /// is stopped first and then started again.
    ///
    /// Returns `Ok(false)` if a `before_*` hook vetoed. A failing `on_start`
    /// leaves the component Stopped and returns the error.
    pub async fn start<L>(&self, hooks: &L) -> Result<bool, LifecycleError>
    where
        L: Lifecycle + ?Sized,
    {
        let _gate = self.gate.lock().await;

        if self.state().is_active() {
            debug!(component = %self.name, "Restarting");
            if !self.stop_locked(hooks).await? {
                return Ok(false);
            }
        }

        if !hooks.before_start().await {
            debug!(component = %self.name, "Start vetoed");
            return Ok(false);
        }

        self.transition(ControlState::Starting);
        match hooks.on_start().await {
            Ok(()) => {
                self.transition(ControlState::Running);
                hooks.after_start().await;
                Ok(true)
            }
            Err(e) => {
                warn!(component = %self.name, "Start failed: {}", e);
                self.transition(ControlState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop the component. No-op when already Stopped or Stopping.
    ///
    /// The component ends Stopped even if `on_stop` fails; the failure is
    /// still returned.
    pub async fn stop<L>(&self, hooks: &L) -> Result<bool, LifecycleError>
    where
        L: Lifecycle + ?Sized,
    {
        let _gate = self.gate.lock().await;
        self.stop_locked(hooks).await
    }

    async fn stop_locked<L>(&self, hooks: &L) -> Result<bool, LifecycleError>
    where
        L: Lifecycle + ?Sized,
    {
        if matches!(
            self.state(),
            ControlState::Stopped | ControlState::Stopping
        ) {
            return Ok(false);
        }

        if !hooks.before_stop().await {
            debug!(component = %self.name, "Stop vetoed");
            return Ok(false);
        }

        self.transition(ControlState::Stopping);
        let result = hooks.on_stop().await;
        self.transition(ControlState::Stopped);
        hooks.after_stop().await;

        if let Err(e) = &result {
            warn!(component = %self.name, "Stop failed: {}", e);
        }
        result.map(|()| true)
    }

    fn transition(&self, next: ControlState) {
        let previous = ControlState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        debug!(component = %self.name, "{} -> {}", previous, next);
        let _ = self.changes.send(StateChange {
            previous,
            current: next,
        });
    }
}
