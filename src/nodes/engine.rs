//! Turns steering/throttle percentages from the context into servo angle, motor
//! speed and direction, and drives them through an [`Actuator`].

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{UnitSpec, base_config, boxed, parse_args};
use crate::actuator::{Actuator, ActuatorCommand, Direction, LogActuator};
use crate::config::{ConfigError, Settings};
use crate::node::{CallbackRegistry, Emit, Node, Unit};
use crate::util::range_map_int;

pub const PILOT_STEERING: &str = "pilot/steering";
pub const USER_STEERING: &str = "user/steering";
pub const USER_THROTTLE: &str = "user/throttle";
pub const STEERING_ANGLE: &str = "engine/steering-angle";
pub const THROTTLE_SPEED: &str = "engine/throttle-speed";
pub const DIRECTION: &str = "engine/direction";

const ENGINE_RATE: f64 = 60.0;

pub struct Engine {
    actuator: Box<dyn Actuator>,
    channel: u8,
    min_turn_angle: f64,
    max_turn_angle: f64,
    turn_offset: i64,
    throttle_floor: f64,
    max_speed: f64,
}

#[derive(Deserialize)]
#[serde(default)]
struct EngineArgs {
    /// Slowest motor duty for a non-zero throttle.
    throttle_floor: i64,
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self { throttle_floor: 50 }
    }
}

impl Engine {
    pub fn new(actuator: Box<dyn Actuator>, settings: &Settings, throttle_floor: i64) -> Self {
        Self {
            actuator,
            channel: settings.front_wheel_channel,
            min_turn_angle: settings.min_turn_angle as f64,
            max_turn_angle: settings.max_turn_angle as f64,
            turn_offset: settings.turn_offset,
            throttle_floor: throttle_floor as f64,
            max_speed: settings.max_speed as f64,
        }
    }

    fn steer(&mut self, percent: &Value) -> anyhow::Result<Emit> {
        let percent = number(percent)?;
        let angle = range_map_int(percent, -1.0, 1.0, self.min_turn_angle, self.max_turn_angle) + self.turn_offset;
        self.actuator.apply(ActuatorCommand::Angle { channel: self.channel, angle })?;
        Ok(Emit::One(json!(angle)))
    }

    fn throttle(&mut self, percent: &Value) -> anyhow::Result<Emit> {
        let percent = number(percent)?;
        let speed = range_map_int(percent.abs(), 0.0, 1.0, self.throttle_floor, self.max_speed);
        let direction = if percent > 0.0 {
            Direction::Forward
        } else if percent < 0.0 {
            Direction::Backward
        } else {
            Direction::Stop
        };
        self.actuator.apply(ActuatorCommand::Speed(speed))?;
        self.actuator.apply(ActuatorCommand::Direction(direction))?;
        Ok(Emit::Many(vec![json!(speed), json!(direction)]))
    }
}

fn number(v: &Value) -> anyhow::Result<f64> {
    match v {
        Value::Null => Ok(0.0),
        other => other.as_f64().ok_or_else(|| anyhow!("expected a number, got {other}")),
    }
}

#[async_trait]
impl Node for Engine {
    fn callbacks() -> CallbackRegistry<Self> {
        CallbackRegistry::<Self>::new()
            .with("on_pilot_steering", |n, args| n.steer(&args[0]))
            .with("on_user_steering", |n, args| n.steer(&args[0]))
            .with("on_user_throttle", |n, args| n.throttle(&args[0]))
    }

    async fn start_up(&mut self) -> anyhow::Result<()> {
        info!(channel = self.channel, "engine ready");
        self.actuator.apply(ActuatorCommand::Direction(Direction::Stop))
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.actuator.apply(ActuatorCommand::Speed(0))?;
        self.actuator.apply(ActuatorCommand::Direction(Direction::Stop))
    }
}

pub fn build(spec: &UnitSpec) -> Result<Box<dyn Unit>, ConfigError> {
    let args: EngineArgs = parse_args("engine", &spec.args)?;
    let engine = Engine::new(Box::new(LogActuator::new(&spec.settings)), &spec.settings, args.throttle_floor);
    boxed(engine, engine_config(spec)?, spec)
}

fn engine_config(spec: &UnitSpec) -> Result<crate::node::NodeConfig, ConfigError> {
    Ok(base_config("engine", spec, ENGINE_RATE)?
        .bind("on_pilot_steering", [PILOT_STEERING], [STEERING_ANGLE])
        .bind("on_user_steering", [USER_STEERING], [STEERING_ANGLE])
        .bind("on_user_throttle", [USER_THROTTLE], [THROTTLE_SPEED, DIRECTION]))
}
