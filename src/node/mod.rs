//! Nodes: units of work bound to the context through named callbacks.
//!
//! A node type registers its callbacks in a [`CallbackRegistry`]; a
//! [`NodeConfig`] then binds callback names to input and output keys. The
//! [`NodeRunner`] drives the clocked loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use unit_plugin::message::UnitState;

use crate::context::{Context, ContextError};

pub mod binding;
pub mod runner;

pub use binding::{BindingSpec, CallbackRegistry, NodeConfig, PROCESS_LOOP};
pub use runner::NodeRunner;

/// What a callback hands back for its declared outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Emit {
    /// No output this time.
    Nothing,
    /// Exactly one value, for a callback with one output key.
    One(Value),
    /// Positional values, one per output key.
    Many(Vec<Value>),
}

impl Emit {
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Emit::Nothing => Vec::new(),
            Emit::One(v) => vec![v],
            Emit::Many(vs) => vs,
        }
    }
}

/// Receives the snapshot of the bound inputs, in declaration order.
pub type Callback<N> = fn(&mut N, Vec<Value>) -> anyhow::Result<Emit>;

#[async_trait]
pub trait Node: Send + Sized + 'static {
    /// Every callback this node type can bind, by stable name.
    fn callbacks() -> CallbackRegistry<Self>;

    /// Runs once before the first tick.
    async fn start_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Always runs last, even when the loop failed.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Cooperative stop request shared by the orchestrator side of a unit and its loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(CancellationToken);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time only.
    pub fn set(&self) -> bool {
        let first = !self.0.is_cancelled();
        self.0.cancel();
        first
    }

    pub fn is_set(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

/// Lifecycle and tick counter, readable while the node runs.
#[derive(Debug, Default)]
pub struct NodeStatus {
    state: Mutex<UnitState>,
    ticks: AtomicU64,
}

impl NodeStatus {
    pub fn state(&self) -> UnitState {
        self.state.lock().map(|s| *s).unwrap_or(UnitState::Terminated)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Moves only along legal lifecycle edges; returns whether it moved.
    pub fn advance(&self, next: UnitState) -> bool {
        match self.state.lock() {
            Ok(mut state) if state.can_transition_to(next) => {
                *state = next;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_tick(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub ticks: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node '{node}': callback '{callback}' failed: {error:#}")]
    Callback { node: String, callback: String, error: anyhow::Error },
    #[error("node '{node}': start_up failed: {error:#}")]
    StartUp { node: String, error: anyhow::Error },
    #[error("node '{node}': shutdown failed: {error:#}")]
    Shutdown { node: String, error: anyhow::Error },
    #[error("node '{node}': {error}")]
    Context { node: String, error: ContextError },
}

/// A runnable node with its type erased, as built from a profile entry.
#[async_trait]
pub trait Unit: Send {
    fn name(&self) -> &str;
    fn status(&self) -> Arc<NodeStatus>;
    async fn run(self: Box<Self>, ctx: Arc<dyn Context>, stop: StopSignal) -> Result<RunReport, NodeError>;
}
