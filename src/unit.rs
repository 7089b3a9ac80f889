//! Entry point of an execution unit: one OS process hosting exactly one node.
//!
//! The orchestrator spawns `autorc unit`, then drives it over stdin/stdout
//! with the control protocol of the `unit_plugin` crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};
use unit_plugin::UnitHandler;
use unit_plugin::message::*;
use unit_plugin::unit_runtime;

use crate::config::Settings;
use crate::context::{Context, ContextClient};
use crate::logger::{LogConfig, LogGuard, Logger, init_tracing};
use crate::node::{NodeStatus, StopSignal};
use crate::nodes::{NodeRegistry, UnitSpec};

struct Inner {
    registry: NodeRegistry,
    stop: StopSignal,
    started: AtomicBool,
    status: Mutex<Option<Arc<NodeStatus>>>,
    /// `Some(success)` once the node lifecycle is over.
    finished: watch::Sender<Option<bool>>,
    log_guard: Mutex<Option<LogGuard>>,
}

#[derive(Clone)]
pub struct NodeUnit {
    inner: Arc<Inner>,
}

impl NodeUnit {
    pub fn new(registry: NodeRegistry) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                registry,
                stop: StopSignal::new(),
                started: AtomicBool::new(false),
                status: Mutex::new(None),
                finished,
                log_guard: Mutex::new(None),
            }),
        }
    }

    /// Resolves with the node's success once its lifecycle is over. A unit
    /// whose node never started counts as a clean finish.
    pub async fn finished(&self) -> bool {
        if !self.inner.started.load(Ordering::SeqCst) {
            return true;
        }
        self.wait_finished().await
    }

    async fn wait_finished(&self) -> bool {
        let mut rx = self.inner.finished.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .map(|done| (*done).unwrap_or(false))
            .unwrap_or(false)
    }

    fn install_logging(&self, params: &InitParams) {
        let cfg = LogConfig::new(params.log_level, params.log_dir.clone(), format!("{}.log", params.unit_id));
        match init_tracing(&cfg) {
            Ok((_, guard)) => {
                if let Ok(mut slot) = self.inner.log_guard.lock() {
                    *slot = Some(guard);
                }
            }
            Err(e) => eprintln!("unit {}: {e:#}", params.unit_id),
        }
    }

    async fn start_node(&self, params: InitParams) -> Result<(), String> {
        let settings: Settings = if params.settings.is_null() {
            Settings::default()
        } else {
            serde_json::from_value(params.settings.clone()).map_err(|e| format!("bad settings: {e}"))?
        };

        let spec = UnitSpec {
            name: params.unit_id.clone(),
            args: params.args.clone(),
            settings,
            logger: Logger::tracing(),
        };
        let node = self
            .inner
            .registry
            .build(&params.node_type, &spec)
            .map_err(|e| e.to_string())?;

        let client = ContextClient::connect(&params.context_address, &params.context_secret, &params.unit_id)
            .await
            .map_err(|e| e.to_string())?;
        let ctx: Arc<dyn Context> = Arc::new(client);

        if let Ok(mut slot) = self.inner.status.lock() {
            *slot = Some(node.status());
        }
        self.inner.started.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let stop = self.inner.stop.clone();
        let unit_id = params.unit_id;
        tokio::spawn(async move {
            let outcome = node.run(ctx, stop).await;
            match &outcome {
                Ok(report) => info!(unit = %unit_id, ticks = report.ticks, "node finished"),
                Err(e) => error!(unit = %unit_id, "node terminated: {e}"),
            }
            inner.finished.send_replace(Some(outcome.is_ok()));
        });
        Ok(())
    }
}

#[async_trait]
impl UnitHandler for NodeUnit {
    async fn init(&mut self, params: InitParams) -> InitResult {
        if self.inner.started.load(Ordering::SeqCst) {
            return InitResult::failed("unit is already initialised");
        }
        if params.version != PROTOCOL_VERSION {
            warn!("orchestrator speaks protocol {}, unit speaks {PROTOCOL_VERSION}", params.version);
        }
        self.install_logging(&params);

        let unit_id = params.unit_id.clone();
        let node_type = params.node_type.clone();
        match self.start_node(params).await {
            Ok(()) => {
                info!(unit = %unit_id, %node_type, "unit initialised");
                InitResult::ok()
            }
            Err(reason) => {
                error!(unit = %unit_id, %node_type, "unit init failed: {reason}");
                InitResult::failed(reason)
            }
        }
    }

    async fn state(&self) -> StateResult {
        match self.inner.status.lock().ok().and_then(|s| s.clone()) {
            Some(status) => StateResult { state: status.state(), ticks: status.ticks() },
            None => StateResult { state: UnitState::Constructed, ticks: 0 },
        }
    }

    async fn health(&self) -> HealthResult {
        let state = self.state().await.state;
        if state.is_live() {
            HealthResult { healthy: true, reason: None }
        } else {
            HealthResult { healthy: false, reason: Some(format!("node is {state}")) }
        }
    }

    async fn stop(&mut self) -> StopResult {
        StopResult { accepted: self.inner.stop.set() }
    }
}

/// Serve the control plane on stdin/stdout until the node is done.
/// Returns the process exit code.
pub async fn run_unit(registry: NodeRegistry) -> anyhow::Result<i32> {
    let unit = NodeUnit::new(registry);
    let control = unit_runtime::run(unit.clone());
    tokio::pin!(control);

    let ok = tokio::select! {
        res = &mut control => {
            // the orchestrator is gone or closed our stdin: the node was told to stop
            res?;
            unit.finished().await
        }
        ok = unit.wait_finished() => ok,
    };
    Ok(if ok { 0 } else { 1 })
}
