use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{Callback, Node};
use crate::config::ConfigError;

/// Name of the callback that runs every tick unless bound to inputs.
pub const PROCESS_LOOP: &str = "process_loop";

pub const DEFAULT_PROCESS_RATE: f64 = 24.0;

/// Explicit name → function table of a node type.
pub struct CallbackRegistry<N> {
    entries: Vec<(&'static str, Callback<N>)>,
}

impl<N> Default for CallbackRegistry<N> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<N> CallbackRegistry<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, callback: Callback<N>) -> Self {
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, callback));
        self
    }

    pub fn get(&self, name: &str) -> Option<Callback<N>> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, cb)| *cb)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub callback: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Per-instance wiring of a node: which callbacks fire on which keys, how fast, how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "default_rate")]
    pub process_rate: f64,
    #[serde(default)]
    pub max_loop: Option<u64>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

fn default_rate() -> f64 {
    DEFAULT_PROCESS_RATE
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), process_rate: DEFAULT_PROCESS_RATE, max_loop: None, bindings: Vec::new() }
    }

    pub fn rate(mut self, process_rate: f64) -> Self {
        self.process_rate = process_rate;
        self
    }

    pub fn max_loop(mut self, max_loop: Option<u64>) -> Self {
        self.max_loop = max_loop;
        self
    }

    pub fn bind<I, O>(mut self, callback: &str, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        self.bindings.push(BindingSpec {
            callback: callback.to_string(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Output keys of the implicit `process_loop`.
    pub fn outputs<O>(self, outputs: O) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
    {
        self.bind(PROCESS_LOOP, Vec::<String>::new(), outputs)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(self.process_rate.is_finite() && self.process_rate > 0.0) {
            return Err(ConfigError::InvalidRate(self.process_rate));
        }
        if self.max_loop == Some(0) {
            return Err(ConfigError::ZeroMaxLoop);
        }
        Ok(())
    }
}

pub(crate) struct Binding<N> {
    pub name: String,
    pub callback: Callback<N>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Resolve declared names against the registry. Input-bound callbacks come back
/// first, idle ones second, both in declaration order. A registered
/// `process_loop` that was not declared runs idle with no outputs.
pub(crate) fn resolve<N: Node>(config: &NodeConfig) -> Result<(Vec<Binding<N>>, Vec<Binding<N>>), ConfigError> {
    let registry = N::callbacks();
    let mut seen = HashSet::new();
    let mut bound = Vec::new();
    let mut idle = Vec::new();

    for spec in &config.bindings {
        if !seen.insert(spec.callback.as_str()) {
            return Err(ConfigError::DuplicateCallback {
                node: config.name.clone(),
                callback: spec.callback.clone(),
            });
        }
        let callback = registry.get(&spec.callback).ok_or_else(|| ConfigError::UnknownCallback {
            node: config.name.clone(),
            callback: spec.callback.clone(),
        })?;
        let binding = Binding {
            name: spec.callback.clone(),
            callback,
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
        };
        if binding.inputs.is_empty() {
            idle.push(binding);
        } else {
            bound.push(binding);
        }
    }

    if !seen.contains(PROCESS_LOOP) {
        if let Some(callback) = registry.get(PROCESS_LOOP) {
            idle.push(Binding { name: PROCESS_LOOP.to_string(), callback, inputs: vec![], outputs: vec![] });
        }
    }

    Ok((bound, idle))
}
