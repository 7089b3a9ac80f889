//! Async runtime that wires **stdin / stdout** JSON‑RPC traffic of a unit
//! process to a user‑supplied `UnitHandler` implementation.
//!
//! * Requests → method dispatch → JSON‑RPC response
//! * Notifications (no `id`) → dispatched, nothing written back
//! * EOF on stdin means the orchestrator is gone: the handler is told to stop
//!
//! Nothing but protocol lines may ever be written to stdout; logging belongs on stderr.

use async_trait::async_trait;
use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

use crate::jsonrpc::{
    INVALID_PARAMS, Id, METHOD_NOT_FOUND, Message, PARSE_ERROR, Request, Response, encode_line,
};
use crate::message::*;
use crate::unit_actor::Method;

#[async_trait]
pub trait UnitHandler: Send + Sync + Clone + 'static {
    /// Bring the unit up: connect to the context, build the node, start its loop.
    async fn init(&mut self, params: InitParams) -> InitResult;
    /// Current lifecycle state.
    async fn state(&self) -> StateResult;
    async fn health(&self) -> HealthResult {
        HealthResult { healthy: true, reason: None }
    }
    /// Ask the unit to finish its current tick and shut down.
    async fn stop(&mut self) -> StopResult;
}

/// Runs the stdin/stdout loop until EOF.
pub async fn run<H: UnitHandler>(handler: H) -> Result<()> {
    serve(handler, io::stdin(), io::stdout()).await
}

/// Same as [`run`] over arbitrary pipes.
pub async fn serve<H, R, W>(mut handler: H, input: R, output: W) -> Result<()>
where
    H: UnitHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(output);
        while let Some(line) = rx.recv().await {
            if let Err(e) = w.write_all(line.as_bytes()).await {
                warn!("control write error: {e}");
                break;
            }
            if w.flush().await.is_err() {
                warn!("control flush error");
                break;
            }
        }
    });

    let mut reader = BufReader::new(input);
    let mut line = String::new();

    while reader.read_line(&mut line).await? != 0 {
        trim_newlines(&mut line);
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(&line) {
            Ok(Message::Request(req)) => handle_request(&mut handler, req, &tx).await,
            Ok(_) => { /* ignore stray responses */ }
            Err(e) => enqueue(
                &tx,
                Response::fail(Id::Null, PARSE_ERROR, "Parse error", Some(json!(e.to_string()))),
            ),
        }
        line.clear();
    }

    debug!("control input closed, stopping unit");
    handler.stop().await;

    drop(tx);
    let _ = writer.await;
    Ok(())
}

fn trim_newlines(s: &mut String) {
    while matches!(s.chars().last(), Some('\n' | '\r')) {
        s.pop();
    }
}

fn enqueue(tx: &UnboundedSender<String>, resp: Response) {
    match encode_line(&resp) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!("failed to encode response: {e}"),
    }
}

async fn handle_request<H: UnitHandler>(handler: &mut H, req: Request, tx: &UnboundedSender<String>) {
    let result: Result<Value, Response> = match req.method.parse::<Method>() {
        Ok(Method::Init) => match serde_json::from_value::<InitParams>(req.params.unwrap_or(Value::Null)) {
            Ok(p) => Ok(json!(handler.init(p).await)),
            Err(e) => Err(Response::fail(
                req.id.clone().unwrap_or(Id::Null),
                INVALID_PARAMS,
                "Invalid params",
                Some(json!(e.to_string())),
            )),
        },
        Ok(Method::State) => Ok(json!(handler.state().await)),
        Ok(Method::Health) => Ok(json!(handler.health().await)),
        Ok(Method::Stop) => Ok(json!(handler.stop().await)),
        Err(_) => Err(Response::fail(
            req.id.clone().unwrap_or(Id::Null),
            METHOD_NOT_FOUND,
            "Method not found",
            None,
        )),
    };

    let Some(id) = req.id else { return };
    match result {
        Ok(v) => enqueue(tx, Response::success(id, v)),
        Err(resp) => enqueue(tx, resp),
    }
}
