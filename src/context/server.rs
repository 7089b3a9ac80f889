use std::net::SocketAddr;

use anyhow::Context as _;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unit_plugin::jsonrpc::{
    APPLICATION_ERROR, Id, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, Message, PARSE_ERROR,
    Request, Response, UNAUTHORIZED, encode_line,
};

use super::protocol::*;
use super::{ContextError, ContextStore};
use crate::secret::SharedSecret;

/// Longest line accepted before `hello` succeeded.
const HELLO_MAX_LINE: usize = 4 * 1024;
/// Longest line accepted from an authenticated client; camera frames travel as values.
const MAX_LINE: usize = 16 * 1024 * 1024;

/// Serves one [`ContextStore`] to every unit of a vehicle, and to remote vehicles
/// attaching through the bridge.
#[derive(Debug)]
pub struct ContextServer {
    local_addr: SocketAddr,
    store: ContextStore,
    cancel: CancellationToken,
}

impl ContextServer {
    pub async fn bind(addr: &str, store: ContextStore, secret: SharedSecret) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind context service on {addr}"))?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!(%local_addr, "context service listening");

        let accept_store = store.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let conn = Connection {
                            store: accept_store.clone(),
                            secret: secret.clone(),
                            peer,
                            client: None,
                        };
                        let cancel = accept_cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                res = conn.serve(stream) => {
                                    if let Err(e) = res {
                                        debug!(%peer, "context connection ended: {e:#}");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!("context accept failed: {e}"),
                }
            }
            debug!("context service stopped accepting");
        });

        Ok(Self { local_addr, store, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ContextServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Connection {
    store: ContextStore,
    secret: SharedSecret,
    peer: SocketAddr,
    /// Set once `hello` succeeded.
    client: Option<String>,
}

impl Connection {
    async fn serve(mut self, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let (rd, mut wr) = stream.into_split();
        let mut lines = FramedRead::new(rd, LinesCodec::new_with_max_length(HELLO_MAX_LINE));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(peer = %self.peer, authenticated = self.client.is_some(), "line too long, closing connection");
                    return Ok(());
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Message>(&line) {
                Ok(Message::Request(req)) => match req.id.clone() {
                    Some(id) => {
                        let was_anonymous = self.client.is_none();
                        let response = self.handle(id, req);
                        if was_anonymous && self.client.is_some() {
                            *lines.decoder_mut() = LinesCodec::new_with_max_length(MAX_LINE);
                        }
                        response
                    }
                    None => {
                        debug!(peer = %self.peer, method = %req.method, "ignoring notification");
                        continue;
                    }
                },
                Ok(Message::Response(_)) => {
                    Response::fail(Id::Null, INVALID_REQUEST, "Invalid request", None)
                }
                Err(e) => Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string()))),
            };
            wr.write_all(encode_line(&response)?.as_bytes()).await?;
        }
        if let Some(client) = &self.client {
            debug!(peer = %self.peer, %client, "context client disconnected");
        }
        Ok(())
    }

    fn handle(&mut self, id: Id, req: Request) -> Response {
        let method = match req.method.parse::<ContextMethod>() {
            Ok(m) => m,
            Err(_) => return Response::fail(id, METHOD_NOT_FOUND, "Method not found", None),
        };

        if method == ContextMethod::Hello {
            return match params::<HelloParams>(req.params) {
                Ok(p) if self.secret.verify(&p.secret) => {
                    debug!(peer = %self.peer, client = %p.client, "context client authenticated");
                    self.client = Some(p.client);
                    let vehicle_name = self
                        .store
                        .read(&["vehicle_name".to_string()], &Value::Null)
                        .pop()
                        .and_then(|v| v.as_str().map(str::to_owned));
                    Response::success(id, json!(HelloResult { vehicle_name }))
                }
                Ok(p) => {
                    warn!(peer = %self.peer, client = %p.client, "context client sent a wrong secret");
                    Response::fail(id, UNAUTHORIZED, "Unauthorized", None)
                }
                Err(resp) => resp.with_id(id),
            };
        }

        if self.client.is_none() {
            return Response::fail(id, UNAUTHORIZED, "Unauthorized", None);
        }

        let outcome = match method {
            ContextMethod::Get => params::<GetParams>(req.params)
                .map(|p| self.store.read(&[p.key], &p.default).pop().unwrap_or(Value::Null)),
            ContextMethod::GetMany => {
                params::<GetManyParams>(req.params).map(|p| json!(self.store.read(&p.keys, &p.default)))
            }
            ContextMethod::Put => params::<PutParams>(req.params)
                .and_then(|p| write(&self.store, vec![p.key], vec![p.value])),
            ContextMethod::PutMany => {
                params::<PutManyParams>(req.params).and_then(|p| write(&self.store, p.keys, p.values))
            }
            ContextMethod::Keys => Ok(json!(self.store.key_list())),
            ContextMethod::Hello => unreachable!("handled above"),
        };

        match outcome {
            Ok(v) => Response::success(id, v),
            Err(resp) => resp.with_id(id),
        }
    }
}

/// Error response whose id is filled in by the caller.
struct Failure(Response);

impl Failure {
    fn with_id(self, id: Id) -> Response {
        Response { id, ..self.0 }
    }
}

fn params<T: DeserializeOwned>(raw: Option<Value>) -> Result<T, Failure> {
    serde_json::from_value(raw.unwrap_or(Value::Null)).map_err(|e| {
        Failure(Response::fail(Id::Null, INVALID_PARAMS, "Invalid params", Some(json!(e.to_string()))))
    })
}

fn write(store: &ContextStore, keys: Vec<String>, values: Vec<Value>) -> Result<Value, Failure> {
    match store.write(keys, values) {
        Ok(timestamp) => Ok(json!(PutResult { timestamp })),
        Err(e @ ContextError::BatchArity { .. }) => {
            Err(Failure(Response::fail(Id::Null, INVALID_PARAMS, e.to_string(), None)))
        }
        Err(e) => Err(Failure(Response::fail(Id::Null, APPLICATION_ERROR, e.to_string(), None))),
    }
}
