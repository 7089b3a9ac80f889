use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use unit_plugin::jsonrpc::{Id, Message, Request, Response, UNAUTHORIZED, encode_line};
use uuid::Uuid;

use super::protocol::*;
use super::{Context, ContextError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Inflight = Arc<DashMap<String, oneshot::Sender<Response>>>;

/// Handle on a remote [`ContextStore`](super::ContextStore) served by a [`ContextServer`](super::ContextServer).
///
/// Cheap to clone; all clones share one TCP connection.
#[derive(Debug, Clone)]
pub struct ContextClient {
    address: String,
    tx: mpsc::Sender<String>,
    inflight: Inflight,
    /// Cancelled once the server side of the connection is gone.
    closed: CancellationToken,
    vehicle_name: Option<String>,
}

impl ContextClient {
    /// Connect and authenticate. Fails with [`ContextError::Unauthorized`] on a wrong secret.
    pub async fn connect(address: &str, secret: &str, client_name: &str) -> Result<Self, ContextError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| ContextError::Transport(format!("timed out connecting to {address}")))?
            .map_err(|e| ContextError::Transport(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true).ok();
        let (rd, mut wr) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let inflight: Inflight = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        {
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let line = tokio::select! {
                        _ = closed.cancelled() => break,
                        line = rx.recv() => match line {
                            Some(line) => line,
                            None => break,
                        },
                    };
                    if wr.write_all(line.as_bytes()).await.is_err() {
                        closed.cancel();
                        break;
                    }
                }
            });
        }

        {
            let inflight = Arc::clone(&inflight);
            let closed = closed.clone();
            let address = address.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(rd).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Id::String(key) = &rsp.id {
                                if let Some((_, waiter)) = inflight.remove(key) {
                                    let _ = waiter.send(rsp);
                                }
                            } else {
                                warn!(%address, "context reply without a usable id: {:?}", rsp.error);
                            }
                        }
                        Ok(Message::Request(req)) => debug!(%address, method = %req.method, "unexpected request"),
                        Err(e) => warn!(%address, "bad context line: {e}"),
                    }
                }
                debug!(%address, "context connection closed");
                // cancel before clearing so a waiter inserted after the clear sees it
                closed.cancel();
                inflight.clear();
            });
        }

        let mut client = Self { address: address.to_owned(), tx, inflight, closed, vehicle_name: None };
        let hello: HelloResult = client
            .call(
                ContextMethod::Hello,
                HelloParams { secret: secret.to_owned(), client: client_name.to_owned() },
            )
            .await?;
        client.vehicle_name = hello.vehicle_name;
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `vehicle_name` reported by the serving vehicle at connect time.
    pub fn vehicle_name(&self) -> Option<&str> {
        self.vehicle_name.as_deref()
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: ContextMethod,
        params: P,
    ) -> Result<T, ContextError> {
        let key = Uuid::new_v4().to_string();
        let params = serde_json::to_value(params).map_err(|e| ContextError::Protocol(e.to_string()))?;
        let req = Request::call(Id::String(key.clone()), method.to_string(), Some(params));
        let line = encode_line(&req).map_err(|e| ContextError::Protocol(e.to_string()))?;

        let gone = || ContextError::Transport(format!("connection to {} is closed", self.address));
        let (waiter, rx) = oneshot::channel();
        self.inflight.insert(key.clone(), waiter);
        if self.closed.is_cancelled() || self.tx.send(line).await.is_err() {
            self.inflight.remove(&key);
            return Err(gone());
        }
        let rsp = tokio::select! {
            biased;
            rsp = rx => rsp.map_err(|_| gone())?,
            _ = self.closed.cancelled() => {
                self.inflight.remove(&key);
                return Err(gone());
            }
        };

        match rsp.into_result() {
            Ok(v) => serde_json::from_value(v).map_err(|e| ContextError::Protocol(e.to_string())),
            Err(e) if e.code == UNAUTHORIZED => Err(ContextError::Unauthorized),
            Err(e) => Err(ContextError::Rpc { code: e.code, message: e.message }),
        }
    }
}

#[async_trait]
impl Context for ContextClient {
    async fn get_many(&self, keys: &[String], default: Value) -> Result<Vec<Value>, ContextError> {
        let values: Vec<Value> = self
            .call(ContextMethod::GetMany, GetManyParams { keys: keys.to_vec(), default })
            .await?;
        if values.len() != keys.len() {
            return Err(ContextError::Protocol(format!(
                "asked for {} keys, got {} values",
                keys.len(),
                values.len()
            )));
        }
        Ok(values)
    }

    async fn put_many(&self, keys: Vec<String>, values: Vec<Value>) -> Result<f64, ContextError> {
        if keys.len() != values.len() {
            return Err(ContextError::BatchArity { keys: keys.len(), values: values.len() });
        }
        let res: PutResult = self.call(ContextMethod::PutMany, PutManyParams { keys, values }).await?;
        Ok(res.timestamp)
    }

    async fn keys(&self) -> Result<Vec<String>, ContextError> {
        self.call(ContextMethod::Keys, serde_json::json!({})).await
    }

    fn name(&self) -> String {
        format!("remote({})", self.address)
    }

    async fn get_or(&self, key: &str, default: Value) -> Result<Value, ContextError> {
        self.call(ContextMethod::Get, GetParams { key: key.to_owned(), default }).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<f64, ContextError> {
        let res: PutResult = self
            .call(ContextMethod::Put, PutParams { key: key.to_owned(), value })
            .await?;
        Ok(res.timestamp)
    }
}
