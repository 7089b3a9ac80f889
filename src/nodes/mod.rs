//! Node types a profile can name, and the registry that builds them inside a unit.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::config::{ConfigError, Settings};
use crate::logger::Logger;
use crate::node::{Node, NodeConfig, NodeRunner, Unit};

pub mod basic;
pub mod engine;
pub mod pilot;

/// Everything a builder gets to construct one node instance.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Instance name, used as logging context, e.g. `engine-2`.
    pub name: String,
    pub args: Value,
    pub settings: Settings,
    pub logger: Logger,
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self { name: name.into(), args, settings: Settings::default(), logger: Logger::tracing() }
    }
}

pub type Builder = fn(&UnitSpec) -> Result<Box<dyn Unit>, ConfigError>;

#[derive(Clone)]
pub struct NodeRegistry {
    builders: BTreeMap<&'static str, Builder>,
}

impl NodeRegistry {
    pub fn empty() -> Self {
        Self { builders: BTreeMap::new() }
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with("constant", basic::build_constant)
            .with("increment", basic::build_increment)
            .with("counter", basic::build_counter)
            .with("sum", basic::build_sum)
            .with("faulty", basic::build_faulty)
            .with("engine", engine::build)
            .with("pilot-switch", pilot::build)
    }

    pub fn with(mut self, node_type: &'static str, builder: Builder) -> Self {
        self.builders.insert(node_type, builder);
        self
    }

    pub fn types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.builders.contains_key(node_type)
    }

    pub fn build(&self, node_type: &str, spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
        let builder = self
            .builders
            .get(node_type)
            .ok_or_else(|| ConfigError::UnknownNodeType(node_type.to_string()))?;
        builder(spec)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommonArgs {
    process_rate: Option<f64>,
    max_loop: Option<u64>,
}

/// Deserialize node-specific arguments; `null` reads as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(node_type: &str, args: &Value) -> Result<T, ConfigError> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(args).map_err(|e| ConfigError::InvalidArgs {
        node_type: node_type.to_string(),
        reason: e.to_string(),
    })
}

/// Node config seeded with the common `process_rate` / `max_loop` arguments.
pub(crate) fn base_config(node_type: &str, spec: &UnitSpec, default_rate: f64) -> Result<NodeConfig, ConfigError> {
    let common: CommonArgs = parse_args(node_type, &spec.args)?;
    Ok(NodeConfig::new(spec.name.clone())
        .rate(common.process_rate.unwrap_or(default_rate))
        .max_loop(common.max_loop))
}

pub(crate) fn boxed<N: Node>(node: N, config: NodeConfig, spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    Ok(Box::new(NodeRunner::new(node, config, spec.logger.clone())?))
}
