use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};
use unit_plugin::message::{LogLevel, UnitState};

use super::binding::{Binding, NodeConfig, resolve};
use super::{Emit, Node, NodeError, NodeStatus, RunReport, StopSignal, Unit};
use crate::config::ConfigError;
use crate::context::{Context, ContextError, timestamp_key};
use crate::logger::Logger;

/// Drives one node: start-up hook, clocked ticks, shutdown hook.
pub struct NodeRunner<N: Node> {
    node: N,
    name: String,
    period: Duration,
    max_loop: Option<u64>,
    bound: Vec<Binding<N>>,
    idle: Vec<Binding<N>>,
    /// Last timestamp this node consumed, per input key.
    seen: HashMap<String, f64>,
    logger: Logger,
    status: Arc<NodeStatus>,
}

impl<N: Node> NodeRunner<N> {
    pub fn new(node: N, config: NodeConfig, logger: Logger) -> Result<Self, ConfigError> {
        config.validate()?;
        let (bound, idle) = resolve::<N>(&config)?;
        Ok(Self {
            node,
            period: Duration::from_secs_f64(1.0 / config.process_rate),
            max_loop: config.max_loop,
            name: config.name,
            bound,
            idle,
            seen: HashMap::new(),
            logger,
            status: Arc::new(NodeStatus::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Arc<NodeStatus> {
        Arc::clone(&self.status)
    }

    pub async fn run(mut self, ctx: Arc<dyn Context>, stop: StopSignal) -> Result<RunReport, NodeError> {
        let ctx = ctx.as_ref();
        self.status.advance(UnitState::StartingUp);
        info!(node = %self.name, "starting up");

        let outcome = match self.node.start_up().await {
            Ok(()) => {
                self.status.advance(UnitState::Running);
                self.run_loop(ctx, &stop).await
            }
            Err(error) => Err(NodeError::StartUp { node: self.name.clone(), error }),
        };

        self.status.advance(UnitState::ShuttingDown);
        info!(node = %self.name, "shutting down");
        let down = self.node.shutdown().await;
        self.status.advance(UnitState::Terminated);

        let result = match (outcome, down) {
            (Err(e), down) => {
                if let Err(error) = down {
                    self.report(&format!("shutdown failed after an earlier error: {error:#}"));
                }
                Err(e)
            }
            (Ok(_), Err(error)) => Err(NodeError::Shutdown { node: self.name.clone(), error }),
            (Ok(report), Ok(())) => Ok(report),
        };
        if let Err(e) = &result {
            self.report(&e.to_string());
        }
        result
    }

    async fn run_loop(&mut self, ctx: &dyn Context, stop: &StopSignal) -> Result<RunReport, NodeError> {
        let mut ticks: u64 = 0;
        loop {
            if stop.is_set() {
                debug!(node = %self.name, ticks, "stop observed");
                break;
            }
            if self.max_loop.is_some_and(|max| ticks >= max) {
                info!(node = %self.name, ticks, "max loop reached, exit");
                break;
            }

            let started = Instant::now();
            self.tick(ctx).await?;
            ticks += 1;
            self.status.record_tick(ticks);

            if self.max_loop.is_some_and(|max| ticks >= max) {
                continue;
            }
            // overruns are not caught up
            if let Some(rest) = self.period.checked_sub(started.elapsed()) {
                tokio::select! {
                    _ = tokio::time::sleep(rest) => {}
                    _ = stop.wait() => {}
                }
            }
        }
        Ok(RunReport { ticks })
    }

    async fn tick(&mut self, ctx: &dyn Context) -> Result<(), NodeError> {
        let Self { node, name, bound, idle, seen, logger, .. } = self;
        let mut keys = Vec::new();
        let mut values = Vec::new();

        for binding in bound.iter() {
            let args = fresh_inputs(ctx, &binding.inputs, seen)
                .await
                .map_err(|error| NodeError::Context { node: name.clone(), error })?;
            let Some(args) = args else { continue };
            let emit = invoke(node, name, binding, args)?;
            collect(name, logger, binding, emit, &mut keys, &mut values);
        }

        for binding in idle.iter() {
            let emit = invoke(node, name, binding, Vec::new())?;
            collect(name, logger, binding, emit, &mut keys, &mut values);
        }

        if !keys.is_empty() {
            ctx.put_many(keys, values)
                .await
                .map_err(|error| NodeError::Context { node: name.clone(), error })?;
        }
        Ok(())
    }

    fn report(&self, msg: &str) {
        self.logger.log(LogLevel::Error, &self.name, msg);
    }
}

fn invoke<N>(node: &mut N, name: &str, binding: &Binding<N>, args: Vec<Value>) -> Result<Emit, NodeError> {
    (binding.callback)(node, args).map_err(|error| NodeError::Callback {
        node: name.to_string(),
        callback: binding.name.clone(),
        error,
    })
}

/// Snapshot-read `inputs` with their timestamps. `Some(values)` only when every
/// input exists and is strictly newer than what this node last consumed; the
/// seen map is then advanced for all of them at once.
async fn fresh_inputs(
    ctx: &dyn Context,
    inputs: &[String],
    seen: &mut HashMap<String, f64>,
) -> Result<Option<Vec<Value>>, ContextError> {
    let mut keys = inputs.to_vec();
    keys.extend(inputs.iter().map(|k| timestamp_key(k)));
    let mut snapshot = ctx.get_many(&keys, Value::Null).await?;
    let stamps = snapshot.split_off(inputs.len());

    let mut fresh = Vec::with_capacity(inputs.len());
    for (key, stamp) in inputs.iter().zip(&stamps) {
        let Some(stamp) = stamp.as_f64() else {
            return Ok(None);
        };
        if seen.get(key).is_some_and(|last| *last >= stamp) {
            return Ok(None);
        }
        fresh.push(stamp);
    }
    for (key, stamp) in inputs.iter().zip(fresh) {
        seen.insert(key.clone(), stamp);
    }
    Ok(Some(snapshot))
}

fn collect<N>(
    name: &str,
    logger: &Logger,
    binding: &Binding<N>,
    emit: Emit,
    keys: &mut Vec<String>,
    values: &mut Vec<Value>,
) {
    if emit == Emit::Nothing {
        return;
    }
    let produced = emit.into_values();
    if produced.len() != binding.outputs.len() {
        logger.log(
            LogLevel::Warn,
            name,
            &format!(
                "callback '{}' produced {} value(s) for {} declared output(s), dropped",
                binding.name,
                produced.len(),
                binding.outputs.len()
            ),
        );
        return;
    }
    keys.extend(binding.outputs.iter().cloned());
    values.extend(produced);
}

#[async_trait]
impl<N: Node> Unit for NodeRunner<N> {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> Arc<NodeStatus> {
        NodeRunner::status(self)
    }

    async fn run(self: Box<Self>, ctx: Arc<dyn Context>, stop: StopSignal) -> Result<RunReport, NodeError> {
        NodeRunner::run(*self, ctx, stop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStore;
    use crate::logger::MemoryLogger;
    use crate::node::{CallbackRegistry, PROCESS_LOOP};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Pair {
        fired: Vec<(Value, Value)>,
        loops: u64,
    }

    impl Node for Pair {
        fn callbacks() -> CallbackRegistry<Self> {
            CallbackRegistry::<Self>::new()
                .with("on_drive", |n, args| {
                    n.fired.push((args[0].clone(), args[1].clone()));
                    Ok(Emit::Nothing)
                })
                .with(PROCESS_LOOP, |n, _| {
                    n.loops += 1;
                    Ok(Emit::Nothing)
                })
        }
    }

    fn pair_runner(logger: Logger) -> NodeRunner<Pair> {
        let cfg = NodeConfig::new("pair")
            .rate(1000.0)
            .bind("on_drive", ["x", "y"], Vec::<String>::new());
        NodeRunner::new(Pair::default(), cfg, logger).unwrap()
    }

    #[tokio::test]
    async fn pair_fires_once_per_pair_of_updates() {
        let ctx = ContextStore::new();
        let mut runner = pair_runner(Logger::tracing());

        runner.tick(&ctx).await.unwrap();
        assert!(runner.node.fired.is_empty(), "missing keys never count as updated");

        ctx.put("x", json!(1)).await.unwrap();
        ctx.put("x", json!(2)).await.unwrap();
        runner.tick(&ctx).await.unwrap();
        assert!(runner.node.fired.is_empty(), "only x changed");

        ctx.put("y", json!("a")).await.unwrap();
        runner.tick(&ctx).await.unwrap();
        runner.tick(&ctx).await.unwrap();
        assert_eq!(runner.node.fired, vec![(json!(2), json!("a"))]);

        ctx.put("y", json!("b")).await.unwrap();
        runner.tick(&ctx).await.unwrap();
        assert_eq!(runner.node.fired.len(), 1, "y alone is not a new pair");

        ctx.put("x", json!(3)).await.unwrap();
        runner.tick(&ctx).await.unwrap();
        assert_eq!(runner.node.fired.last(), Some(&(json!(3), json!("b"))));
        assert_eq!(runner.node.loops, 6);
    }

    struct Emitter;

    impl Node for Emitter {
        fn callbacks() -> CallbackRegistry<Self> {
            CallbackRegistry::<Self>::new()
                .with(PROCESS_LOOP, |_, _| Ok(Emit::One(json!(42))))
                .with("pair", |_, _| Ok(Emit::Many(vec![json!(1), json!(2)])))
                .with("short", |_, _| Ok(Emit::Many(vec![json!(1)])))
        }
    }

    #[tokio::test]
    async fn max_loop_runs_exactly_n_ticks_and_writes_outputs() {
        let ctx = Arc::new(ContextStore::new());
        let cfg = NodeConfig::new("emitter").rate(500.0).max_loop(Some(5)).outputs(["out"]);
        let period = 1.0 / cfg.process_rate;
        let runner = NodeRunner::new(Emitter, cfg, Logger::tracing()).unwrap();
        let status = runner.status();

        let report = runner.run(ctx.clone(), StopSignal::new()).await.unwrap();
        assert_eq!(report.ticks, 5);
        assert_eq!(status.ticks(), 5);
        assert_eq!(status.state(), UnitState::Terminated);
        assert_eq!(ctx.get("out").await.unwrap(), json!(42));

        let now = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let ts = ctx.timestamp("out").await.unwrap().unwrap();
        // no sleep follows the last tick, so its write is at most one period old
        let slack = 0.05;
        assert!(now - ts < period + slack, "last write {:.3}s old, period {period}s", now - ts);
    }

    #[tokio::test]
    async fn positional_outputs_share_the_tick_timestamp() {
        let ctx = ContextStore::new();
        let cfg = NodeConfig::new("emitter")
            .outputs(["out"])
            .bind("pair", Vec::<String>::new(), ["a", "b"]);
        let mut runner = NodeRunner::new(Emitter, cfg, Logger::tracing()).unwrap();
        runner.tick(&ctx).await.unwrap();
        assert_eq!(ctx.get("a").await.unwrap(), json!(1));
        assert_eq!(ctx.get("b").await.unwrap(), json!(2));
        let ts = ctx.timestamp("out").await.unwrap();
        assert_eq!(ctx.timestamp("a").await.unwrap(), ts);
        assert_eq!(ctx.timestamp("b").await.unwrap(), ts);
    }

    #[tokio::test]
    async fn arity_mismatch_is_logged_and_dropped() {
        let ctx = ContextStore::new();
        let mem = MemoryLogger::new();
        let cfg = NodeConfig::new("emitter-7")
            .outputs(["out"])
            .bind("short", Vec::<String>::new(), ["a", "b"]);
        let mut runner = NodeRunner::new(Emitter, cfg, mem.logger()).unwrap();

        runner.tick(&ctx).await.unwrap();
        runner.tick(&ctx).await.unwrap();

        assert_eq!(ctx.get("out").await.unwrap(), json!(42), "loop keeps going");
        assert_eq!(ctx.get("a").await.unwrap(), Value::Null);
        let entries = mem.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].context, "emitter-7");
        assert!(entries[0].message.contains("short"));
    }

    #[tokio::test]
    async fn output_without_declared_keys_counts_as_mismatch() {
        let ctx = ContextStore::new();
        let mem = MemoryLogger::new();
        let runner_cfg = NodeConfig::new("bare");
        let mut runner = NodeRunner::new(Emitter, runner_cfg, mem.logger()).unwrap();
        runner.tick(&ctx).await.unwrap();
        assert_eq!(mem.entries().len(), 1);
        assert!(ctx.keys().await.unwrap().is_empty());
    }

    struct Faulty {
        shut_down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Node for Faulty {
        fn callbacks() -> CallbackRegistry<Self> {
            CallbackRegistry::<Self>::new().with(PROCESS_LOOP, |_, _| Err(anyhow::anyhow!("sensor unplugged")))
        }

        async fn shutdown(&mut self) -> anyhow::Result<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn callback_error_terminates_after_shutdown_hook() {
        let flag = Arc::new(AtomicBool::new(false));
        let mem = MemoryLogger::new();
        let runner = NodeRunner::new(
            Faulty { shut_down: flag.clone() },
            NodeConfig::new("faulty-0"),
            mem.logger(),
        )
        .unwrap();
        let status = runner.status();

        let err = runner
            .run(Arc::new(ContextStore::new()), StopSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Callback { ref callback, .. } if callback == PROCESS_LOOP));
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(status.state(), UnitState::Terminated);
        assert_eq!(mem.entries()[0].context, "faulty-0");
        assert!(mem.entries()[0].message.contains("sensor unplugged"));
    }

    #[tokio::test]
    async fn stop_before_first_tick_runs_no_ticks() {
        let stop = StopSignal::new();
        stop.set();
        let runner = pair_runner(Logger::tracing());
        let report = runner.run(Arc::new(ContextStore::new()), stop).await.unwrap();
        assert_eq!(report.ticks, 0);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_tick_sleep() {
        let cfg = NodeConfig::new("slow").rate(0.1).outputs(["out"]);
        let runner = NodeRunner::new(Emitter, cfg, Logger::tracing()).unwrap();
        let stop = StopSignal::new();
        let handle = tokio::spawn(runner.run(Arc::new(ContextStore::new()), stop.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.set();
        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runner did not stop in time")
            .unwrap()
            .unwrap();
        assert_eq!(report.ticks, 1);
    }
}
