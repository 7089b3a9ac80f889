//! Small stand-in nodes: sources, transforms and a deliberately broken one.

use anyhow::bail;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{UnitSpec, base_config, boxed, parse_args};
use crate::config::ConfigError;
use crate::node::{CallbackRegistry, Emit, Node, PROCESS_LOOP, Unit};

fn default_out() -> String {
    "out".to_string()
}

fn default_result() -> String {
    "result".to_string()
}

fn default_step() -> Value {
    json!(1)
}

/// Emits the same value every tick.
pub struct Constant {
    value: Value,
}

#[derive(Deserialize)]
struct ConstantArgs {
    value: Value,
    #[serde(default = "default_out")]
    output: String,
}

impl Node for Constant {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new().with(PROCESS_LOOP, |n, _| Ok(Emit::One(n.value.clone())))
    }
}

pub fn build_constant(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: ConstantArgs = parse_args("constant", &spec.args)?;
    let config = base_config("constant", spec, spec.settings.process_rate)?.outputs([args.output]);
    boxed(Constant { value: args.value }, config, spec)
}

/// `result = input + step` whenever the input changes.
pub struct Increment {
    step: Value,
}

#[derive(Deserialize)]
struct IncrementArgs {
    #[serde(default = "default_out")]
    input: String,
    #[serde(default = "default_result")]
    output: String,
    #[serde(default = "default_step")]
    step: Value,
}

impl Node for Increment {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new().with("on_input", |n, args| Ok(Emit::One(add(&args[0], &n.step)?)))
    }
}

pub fn build_increment(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: IncrementArgs = parse_args("increment", &spec.args)?;
    if !args.step.is_number() {
        return Err(ConfigError::InvalidArgs {
            node_type: "increment".into(),
            reason: format!("step must be a number, got {}", args.step),
        });
    }
    let config = base_config("increment", spec, spec.settings.process_rate)?
        .bind("on_input", [args.input], [args.output]);
    boxed(Increment { step: args.step }, config, spec)
}

/// Counts its own ticks.
#[derive(Default)]
pub struct Counter {
    count: u64,
}

#[derive(Deserialize)]
struct CounterArgs {
    #[serde(default = "default_count")]
    output: String,
}

fn default_count() -> String {
    "count".to_string()
}

impl Node for Counter {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new().with(PROCESS_LOOP, |n, _| {
            n.count += 1;
            Ok(Emit::One(json!(n.count)))
        })
    }
}

pub fn build_counter(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: CounterArgs = parse_args("counter", &spec.args)?;
    let config = base_config("counter", spec, spec.settings.process_rate)?.outputs([args.output]);
    boxed(Counter::default(), config, spec)
}

/// Adds two inputs, once per fresh pair.
pub struct Sum;

#[derive(Deserialize)]
#[serde(default)]
struct SumArgs {
    a: String,
    b: String,
    output: String,
}

impl Default for SumArgs {
    fn default() -> Self {
        Self { a: "a".into(), b: "b".into(), output: "sum".into() }
    }
}

impl Node for Sum {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new().with("on_pair", |_, args| Ok(Emit::One(add(&args[0], &args[1])?)))
    }
}

pub fn build_sum(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: SumArgs = parse_args("sum", &spec.args)?;
    let config = base_config("sum", spec, spec.settings.process_rate)?
        .bind("on_pair", [args.a, args.b], [args.output]);
    boxed(Sum, config, spec)
}

/// Fails its loop once `after` ticks went fine.
pub struct Faulty {
    after: u64,
    ticks: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FaultyArgs {
    after: u64,
}

impl Node for Faulty {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new().with(PROCESS_LOOP, |n, _| {
            if n.ticks >= n.after {
                bail!("faulty node gave up after {} tick(s)", n.ticks);
            }
            n.ticks += 1;
            Ok(Emit::Nothing)
        })
    }
}

pub fn build_faulty(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: FaultyArgs = parse_args("faulty", &spec.args)?;
    let config = base_config("faulty", spec, spec.settings.process_rate)?;
    boxed(Faulty { after: args.after, ticks: 0 }, config, spec)
}

/// Numeric addition that stays integral when both sides are integers.
pub(crate) fn add(a: &Value, b: &Value) -> anyhow::Result<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(json!(sum));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(json!(x + y)),
        _ => bail!("cannot add {b} to {a}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextStore};
    use crate::node::StopSignal;
    use std::sync::Arc;

    #[test]
    fn add_keeps_integers_integral() {
        assert_eq!(add(&json!(42), &json!(1)).unwrap(), json!(43));
        assert_eq!(add(&json!(1.5), &json!(1)).unwrap(), json!(2.5));
        assert!(add(&json!("42"), &json!(1)).is_err());
    }

    #[tokio::test]
    async fn constant_then_increment_yields_43() {
        let ctx = Arc::new(ContextStore::new());
        let constant = build_constant(&UnitSpec::new(
            "constant-0",
            json!({"value": 42, "max_loop": 2, "process_rate": 200.0}),
        ))
        .unwrap();
        constant.run(ctx.clone(), StopSignal::new()).await.unwrap();

        let increment = build_increment(&UnitSpec::new(
            "increment-1",
            json!({"max_loop": 2, "process_rate": 200.0}),
        ))
        .unwrap();
        increment.run(ctx.clone(), StopSignal::new()).await.unwrap();

        assert_eq!(ctx.get("out").await.unwrap(), json!(42));
        assert_eq!(ctx.get("result").await.unwrap(), json!(43));
    }

    #[tokio::test]
    async fn sum_waits_for_both_inputs() {
        let ctx = Arc::new(ContextStore::new());
        ctx.put("a", json!(2)).await.unwrap();
        let sum = build_sum(&UnitSpec::new("sum-0", json!({"max_loop": 1}))).unwrap();
        sum.run(ctx.clone(), StopSignal::new()).await.unwrap();
        assert_eq!(ctx.get("sum").await.unwrap(), Value::Null);

        ctx.put("b", json!(3)).await.unwrap();
        let sum = build_sum(&UnitSpec::new("sum-0", json!({"max_loop": 1}))).unwrap();
        sum.run(ctx.clone(), StopSignal::new()).await.unwrap();
        assert_eq!(ctx.get("sum").await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn counter_counts_ticks() {
        let ctx = Arc::new(ContextStore::new());
        let counter = build_counter(&UnitSpec::new("counter-0", json!({"max_loop": 4, "process_rate": 500.0})))
            .unwrap();
        counter.run(ctx.clone(), StopSignal::new()).await.unwrap();
        assert_eq!(ctx.get("count").await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn faulty_fails_after_grace_ticks() {
        let faulty =
            build_faulty(&UnitSpec::new("faulty-0", json!({"after": 2, "process_rate": 500.0}))).unwrap();
        let status = faulty.status();
        let err = faulty.run(Arc::new(ContextStore::new()), StopSignal::new()).await.unwrap_err();
        assert!(err.to_string().contains("faulty-0"));
        assert_eq!(status.ticks(), 2);
    }

    #[test]
    fn bad_args_are_rejected() {
        assert!(build_constant(&UnitSpec::new("c", Value::Null)).is_err(), "value is required");
        assert!(build_increment(&UnitSpec::new("i", json!({"step": "one"}))).is_err());
    }
}
