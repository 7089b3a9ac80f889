use serde::Deserialize;
use serde_json::Value;

use super::{UnitSpec, base_config, boxed, parse_args};
use crate::config::ConfigError;
use crate::node::{CallbackRegistry, Emit, Node, Unit};

/// Forwards raw autopilot predictions to the `pilot/*` keys the engine listens
/// to, but only while `pilot/engage` is truthy.
#[derive(Default)]
pub struct PilotSwitch {
    enabled: bool,
}

#[derive(Deserialize)]
#[serde(default)]
struct PilotArgs {
    engage: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl Default for PilotArgs {
    fn default() -> Self {
        Self {
            engage: "pilot/engage".into(),
            inputs: vec!["pilot/raw-throttle".into(), "pilot/raw-steering".into()],
            outputs: vec!["pilot/throttle".into(), "pilot/steering".into()],
        }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl Node for PilotSwitch {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new()
            .with("on_pilot_enable", |n, args| {
                n.enabled = truthy(&args[0]);
                Ok(Emit::Nothing)
            })
            .with("on_prediction", |n, args| {
                if n.enabled { Ok(Emit::Many(args)) } else { Ok(Emit::Nothing) }
            })
    }
}

pub fn build(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: PilotArgs = parse_args("pilot-switch", &spec.args)?;
    if args.inputs.is_empty() || args.inputs.len() != args.outputs.len() {
        return Err(ConfigError::InvalidArgs {
            node_type: "pilot-switch".into(),
            reason: format!(
                "needs as many outputs as inputs (got {} inputs, {} outputs)",
                args.inputs.len(),
                args.outputs.len()
            ),
        });
    }
    let config = base_config("pilot-switch", spec, spec.settings.process_rate)?
        .bind("on_pilot_enable", [args.engage], Vec::<String>::new())
        .bind("on_prediction", args.inputs, args.outputs);
    boxed(PilotSwitch::default(), config, spec)
}
