use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jsonrpc::{Id, Message, Request, Response, encode_line};
use crate::message::*;

// -----------------------------------------------------------------------------
// Control-plane methods understood by every unit
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    Init,
    State,
    Health,
    Stop,
}

type Outgoing = (Request, Option<oneshot::Sender<Response>>);

/// Orchestrator-side handle on one unit process.
///
/// The child speaks JSON-RPC on its stdin/stdout; stderr is inherited so the
/// unit's own log output lands next to the orchestrator's.
#[derive(Debug)]
pub struct UnitHandle {
    unit_id: String,
    tx: mpsc::Sender<Outgoing>,
    child: Child,
    pid: Option<u32>,
}

impl UnitHandle {
    /// Launch `program args...` as a unit process and wire up the control plane.
    pub fn spawn<S, I>(program: impl AsRef<OsStr>, args: I, unit_id: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let unit_id = unit_id.into();
        let mut child = TokioCommand::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("failed to spawn unit '{unit_id}': {e}"))?;

        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("unit '{unit_id}' has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("unit '{unit_id}' has no stdout"))?;

        let (tx, mut rx) = mpsc::channel::<Outgoing>(32);

        // track in-flight calls by encoded `id`
        let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        {
            let inflight = Arc::clone(&inflight);
            let unit_id = unit_id.clone();
            tokio::spawn(async move {
                while let Some((req, rsp_tx)) = rx.recv().await {
                    let line = match encode_line(&req) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(unit = %unit_id, "dropping unserialisable request: {e}");
                            continue;
                        }
                    };
                    if let (Some(id), Some(rsp_tx)) = (&req.id, rsp_tx) {
                        inflight.insert(id_key(id), rsp_tx);
                    }
                    if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                        debug!(unit = %unit_id, "control pipe closed");
                        break;
                    }
                }
                // dropping stdin here gives the unit EOF
            });
        }

        {
            let inflight = Arc::clone(&inflight);
            let unit_id = unit_id.clone();
            tokio::spawn(async move {
                let mut rdr = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = rdr.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, tx_rsp)) = inflight.remove(&id_key(&rsp.id)) {
                                let _ = tx_rsp.send(rsp);
                            }
                        }
                        Ok(Message::Request(req)) => {
                            debug!(unit = %unit_id, method = %req.method, "ignoring request from unit");
                        }
                        Err(e) => warn!(unit = %unit_id, "bad control line: {e}"),
                    }
                }
                // unit is gone, fail whoever is still waiting
                inflight.clear();
            });
        }

        Ok(Self { unit_id, tx, child, pid })
    }

    pub fn id(&self) -> &str {
        &self.unit_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn call(&self, req: Request) -> Result<Response> {
        let (tx_resp, rx_resp) = oneshot::channel();
        self.tx
            .send((req, Some(tx_resp)))
            .await
            .map_err(|_| anyhow!("unit '{}' control pipe is closed", self.unit_id))?;
        rx_resp
            .await
            .map_err(|_| anyhow!("unit '{}' dropped response", self.unit_id))
    }

    /// Call any control method and deserialize the `.result` into the requested type.
    async fn rpc_call<T: DeserializeOwned>(&self, method: Method, params: Option<Value>) -> Result<T> {
        let req = Request::call(Id::String(Uuid::new_v4().to_string()), method.to_string(), params);
        let rsp = self.call(req).await?;
        let v = rsp
            .into_result()
            .map_err(|e| anyhow!("unit '{}' rejected {method}: {e}", self.unit_id))?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn rpc_notify<P: Serialize>(&self, method: Method, params: Option<P>) -> Result<()> {
        let params = params.map(serde_json::to_value).transpose()?;
        let req = Request::notification(method.to_string(), params);
        self.tx
            .send((req, None))
            .await
            .map_err(|_| anyhow!("unit '{}' control pipe is closed", self.unit_id))
    }

    // ---------------------------------------------------------------------
    // Convenience wrappers
    // ---------------------------------------------------------------------

    pub async fn init(&self, params: InitParams) -> Result<InitResult> {
        let msg = serde_json::to_value(params)
            .map_err(|err| anyhow!("Failed to serialize InitParams: {}", err))?;
        self.rpc_call::<InitResult>(Method::Init, Some(msg)).await
    }

    pub async fn state(&self) -> Result<StateResult> {
        self.rpc_call::<StateResult>(Method::State, None).await
    }

    pub async fn health(&self) -> Result<HealthResult> {
        self.rpc_call::<HealthResult>(Method::Health, None).await
    }

    /// Fire-and-forget; a unit that is already exiting may never answer.
    pub async fn stop(&self) -> Result<()> {
        self.rpc_notify::<Value>(Method::Stop, None).await
    }

    /// Non-blocking: `Some(status)` once the process has exited.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Forcefully terminate the unit and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

fn id_key(id: &Id) -> String {
    match id {
        Id::Number(n) => format!("n:{n}"),
        Id::String(s) => format!("s:{s}"),
        Id::Null => "null".to_owned(),
    }
}
