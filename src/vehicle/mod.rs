//! The orchestrator: owns the context, runs one unit process per registered
//! node, and tears everything down when its control future returns.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use unit_plugin::UnitHandle;
use unit_plugin::message::{InitParams, LogLevel, PROTOCOL_VERSION};

use crate::config::Settings;
use crate::context::{Context, ContextClient, ContextError, ContextServer, ContextStore};
use crate::secret::SharedSecret;

pub mod profile;

pub use profile::{Profile, ProfileError, list_profiles, load_profile};

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    #[error("could not start the context service: {0:#}")]
    ContextService(anyhow::Error),
    #[error("could not attach to the remote context at {address}: {error}")]
    Bridge { address: String, error: ContextError },
    #[error("attaching to a remote context requires its shared secret")]
    MissingSecret,
    #[error("could not locate the unit executable: {0}")]
    UnitProgram(std::io::Error),
    #[error("could not spawn unit '{unit}': {reason}")]
    Spawn { unit: String, reason: String },
    #[error("unit '{unit}' failed to initialise: {reason}")]
    UnitInit { unit: String, reason: String },
}

/// Where the vehicle's context lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSource {
    /// Create and serve a fresh context on `bind`.
    Local { bind: String },
    /// Attach to the context another vehicle exposes.
    Remote { address: String },
}

#[derive(Debug, Clone)]
pub struct VehicleOptions {
    pub name: String,
    pub grace_period: Duration,
    pub init_timeout: Duration,
    /// Executable started for every unit, with `unit_args`.
    pub unit_program: PathBuf,
    pub unit_args: Vec<String>,
    pub context: ContextSource,
    /// Generated for a local context when unset; required for a remote one.
    pub secret: Option<SharedSecret>,
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    pub settings: Settings,
}

impl VehicleOptions {
    /// Units are this very executable, started as `<exe> unit`.
    pub fn from_settings(settings: &Settings) -> Result<Self, VehicleError> {
        let exe = std::env::current_exe().map_err(VehicleError::UnitProgram)?;
        Ok(Self::with_program(exe, settings))
    }

    pub fn with_program(unit_program: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            name: settings.vehicle_name.clone(),
            grace_period: Duration::from_millis(settings.grace_period_ms),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            unit_program: unit_program.into(),
            unit_args: vec!["unit".to_string()],
            context: ContextSource::Local { bind: settings.context_bind.clone() },
            secret: None,
            log_level: settings.log_level,
            log_dir: settings.log_dir.clone(),
            settings: settings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub node_type: String,
    pub args: Value,
}

/// Handed to the control future while the vehicle runs.
#[derive(Clone)]
pub struct ControlHandle {
    /// The live context, as the vehicle sees it.
    pub context: Arc<dyn Context>,
    /// Address units (and remote vehicles) connect to.
    pub address: String,
    pub secret: SharedSecret,
    pub units: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Exited on its own before shutdown began.
    FinishedEarly { code: Option<i32> },
    /// Exited within the grace period after the stop request.
    Stopped { code: Option<i32> },
    /// Still alive at the end of the grace period.
    Killed,
}

impl UnitOutcome {
    pub fn crashed(&self) -> bool {
        matches!(self, UnitOutcome::FinishedEarly { code } if *code != Some(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub unit_id: String,
    pub node_type: String,
    pub outcome: UnitOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub vehicle: String,
    pub units: Vec<UnitReport>,
}

impl ShutdownReport {
    pub fn outcome(&self, unit_id: &str) -> Option<UnitOutcome> {
        self.units.iter().find(|u| u.unit_id == unit_id).map(|u| u.outcome)
    }

    pub fn crashed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.outcome.crashed())
    }

    pub fn killed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.outcome == UnitOutcome::Killed)
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} shut down:", self.vehicle)?;
        for u in &self.units {
            let what = match u.outcome {
                UnitOutcome::FinishedEarly { code } if u.outcome.crashed() => format!("crashed ({})", code_str(code)),
                UnitOutcome::FinishedEarly { .. } => "finished early".to_string(),
                UnitOutcome::Stopped { code } => format!("stopped ({})", code_str(code)),
                UnitOutcome::Killed => "killed after grace period".to_string(),
            };
            writeln!(f, "  {:<24} {what}", u.unit_id)?;
        }
        Ok(())
    }
}

fn code_str(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("exit {c}"))
}

struct Running {
    unit_id: String,
    node_type: String,
    handle: UnitHandle,
}

pub struct Vehicle {
    options: VehicleOptions,
    nodes: Vec<NodeEntry>,
}

impl Vehicle {
    pub fn new(options: VehicleOptions) -> Self {
        Self { options, nodes: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Bookkeeping only; nothing runs before [`Vehicle::start`].
    pub fn register(&mut self, node_type: impl Into<String>, args: Value) -> &mut Self {
        self.nodes.push(NodeEntry { node_type: node_type.into(), args });
        self
    }

    pub fn nodes(&self) -> &[NodeEntry] {
        &self.nodes
    }

    /// Run until Ctrl-C.
    pub async fn start(self) -> Result<ShutdownReport, VehicleError> {
        self.start_with(|_| async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("could not listen for Ctrl-C: {e}");
            }
        })
        .await
    }

    /// Run until `control` completes, then shut every unit down.
    pub async fn start_with<F, Fut>(self, control: F) -> Result<ShutdownReport, VehicleError>
    where
        F: FnOnce(ControlHandle) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Vehicle { options, nodes } = self;

        // the server, when local, lives until this function returns
        let (context, address, secret, _server) = open_context(&options).await?;

        let mut running: Vec<Running> = Vec::with_capacity(nodes.len());
        for (index, entry) in nodes.iter().enumerate() {
            let unit_id = format!("{}-{index}", entry.node_type);
            info!(unit = %unit_id, "Starting {} up", entry.node_type);
            match launch(&options, &unit_id, entry, &address, &secret).await {
                Ok(handle) => running.push(Running {
                    unit_id,
                    node_type: entry.node_type.clone(),
                    handle,
                }),
                Err(e) => {
                    error!("{e}");
                    for r in &mut running {
                        kill(&mut r.handle).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(vehicle = %options.name, units = running.len(), "vehicle started");
        let handle = ControlHandle {
            context,
            address: address.clone(),
            secret: secret.clone(),
            units: running.iter().map(|r| r.unit_id.clone()).collect(),
        };
        control(handle).await;

        info!(vehicle = %options.name, "shutting down");
        let units = shutdown(running, options.grace_period).await;
        Ok(ShutdownReport { vehicle: options.name, units })
    }
}

type OpenContext = (Arc<dyn Context>, String, SharedSecret, Option<ContextServer>);

async fn open_context(options: &VehicleOptions) -> Result<OpenContext, VehicleError> {
    match &options.context {
        ContextSource::Local { bind } => {
            let secret = options.secret.clone().unwrap_or_else(SharedSecret::generate);
            let store = ContextStore::seeded(&options.name);
            let server = ContextServer::bind(bind, store.clone(), secret.clone())
                .await
                .map_err(VehicleError::ContextService)?;
            let address = connect_address(server.local_addr());
            let context: Arc<dyn Context> = Arc::new(store);
            Ok((context, address, secret, Some(server)))
        }
        ContextSource::Remote { address } => {
            let secret = options.secret.clone().ok_or(VehicleError::MissingSecret)?;
            let client = ContextClient::connect(address, secret.expose(), &options.name)
                .await
                .map_err(|error| VehicleError::Bridge { address: address.clone(), error })?;
            info!(
                %address,
                primary = client.vehicle_name().unwrap_or("?"),
                "attached to remote context"
            );
            let context: Arc<dyn Context> = Arc::new(client);
            Ok((context, address.clone(), secret, None))
        }
    }
}

/// A wildcard bind is reached through loopback.
fn connect_address(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        let loopback = if addr.is_ipv4() { "127.0.0.1" } else { "[::1]" };
        format!("{loopback}:{}", addr.port())
    } else {
        addr.to_string()
    }
}

async fn launch(
    options: &VehicleOptions,
    unit_id: &str,
    entry: &NodeEntry,
    address: &str,
    secret: &SharedSecret,
) -> Result<UnitHandle, VehicleError> {
    let mut handle = UnitHandle::spawn(&options.unit_program, &options.unit_args, unit_id).map_err(|e| {
        VehicleError::Spawn { unit: unit_id.to_string(), reason: format!("{e:#}") }
    })?;

    let params = InitParams {
        version: PROTOCOL_VERSION.to_string(),
        unit_id: unit_id.to_string(),
        node_type: entry.node_type.clone(),
        args: entry.args.clone(),
        context_address: address.to_string(),
        context_secret: secret.expose().to_string(),
        settings: serde_json::to_value(&options.settings).unwrap_or(Value::Null),
        log_level: options.log_level,
        log_dir: options.log_dir.clone(),
    };

    let failure = match tokio::time::timeout(options.init_timeout, handle.init(params)).await {
        Ok(Ok(res)) if res.success => return Ok(handle),
        Ok(Ok(res)) => res.error.unwrap_or_else(|| "no reason given".to_string()),
        Ok(Err(e)) => format!("{e:#}"),
        Err(_) => format!("no answer within {:?}", options.init_timeout),
    };
    kill(&mut handle).await;
    Err(VehicleError::UnitInit { unit: unit_id.to_string(), reason: failure })
}

async fn kill(handle: &mut UnitHandle) {
    if let Err(e) = handle.kill().await {
        debug!(unit = %handle.id(), "kill: {e:#}");
    }
}

/// Note who already died, ask the rest to stop, wait out the grace period, kill survivors.
async fn shutdown(mut running: Vec<Running>, grace: Duration) -> Vec<UnitReport> {
    let mut outcomes: Vec<Option<UnitOutcome>> = Vec::with_capacity(running.len());
    for r in &mut running {
        let early = match r.handle.try_exit_status() {
            Ok(Some(status)) => {
                let outcome = UnitOutcome::FinishedEarly { code: status.code() };
                if outcome.crashed() {
                    warn!(unit = %r.unit_id, "unit died before shutdown ({})", code_str(status.code()));
                }
                Some(outcome)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(unit = %r.unit_id, "could not poll unit: {e:#}");
                None
            }
        };
        if early.is_none() {
            if let Err(e) = r.handle.stop().await {
                debug!(unit = %r.unit_id, "stop request not delivered: {e:#}");
            }
        }
        outcomes.push(early);
    }

    let deadline = Instant::now() + grace;
    let mut reports = Vec::with_capacity(running.len());
    for (mut r, early) in running.into_iter().zip(outcomes) {
        let outcome = match early {
            Some(outcome) => outcome,
            None => match tokio::time::timeout_at(deadline, r.handle.wait()).await {
                Ok(Ok(status)) => UnitOutcome::Stopped { code: status.code() },
                Ok(Err(e)) => {
                    warn!(unit = %r.unit_id, "lost track of unit: {e:#}");
                    kill(&mut r.handle).await;
                    UnitOutcome::Killed
                }
                Err(_) => {
                    warn!(unit = %r.unit_id, "unit ignored stop, killing it");
                    kill(&mut r.handle).await;
                    UnitOutcome::Killed
                }
            },
        };
        reports.push(UnitReport { unit_id: r.unit_id, node_type: r.node_type, outcome });
    }
    reports
}
