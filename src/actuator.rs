//! Seam towards the steering servo and drive motor. Register-level drivers are
//! not part of this crate; the stock actuator only logs what it would do.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::info;

use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorCommand {
    /// Servo on a PWM channel, in degrees.
    Angle { channel: u8, angle: i64 },
    /// Rear motor duty, `MIN_SPEED..=MAX_SPEED`.
    Speed(i64),
    Direction(Direction),
}

pub trait Actuator: Send {
    fn apply(&mut self, cmd: ActuatorCommand) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LogActuator {
    pwm_frequency: u32,
}

impl LogActuator {
    pub fn new(settings: &Settings) -> Self {
        Self { pwm_frequency: settings.pwm_frequency }
    }
}

impl Actuator for LogActuator {
    fn apply(&mut self, cmd: ActuatorCommand) -> anyhow::Result<()> {
        match cmd {
            ActuatorCommand::Angle { channel, angle } => {
                info!(channel, angle, freq = self.pwm_frequency, "servo write")
            }
            ActuatorCommand::Speed(speed) => info!(speed, "motor speed"),
            ActuatorCommand::Direction(direction) => info!(%direction, "motor direction"),
        }
        Ok(())
    }
}

/// Keeps every command; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    commands: Arc<Mutex<Vec<ActuatorCommand>>>,
}

impl RecordingActuator {
    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Actuator for RecordingActuator {
    fn apply(&mut self, cmd: ActuatorCommand) -> anyhow::Result<()> {
        self.commands
            .lock()
            .map_err(|_| anyhow::anyhow!("actuator log poisoned"))?
            .push(cmd);
        Ok(())
    }
}

/// Park every servo channel at the neutral angle.
pub fn reset_servos(actuator: &mut dyn Actuator, settings: &Settings) -> anyhow::Result<()> {
    for channel in 0..settings.servo_channels {
        actuator.apply(ActuatorCommand::Angle { channel, angle: settings.neutral_angle })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_parks_all_sixteen_channels() {
        let mut rec = RecordingActuator::default();
        reset_servos(&mut rec, &Settings::default()).unwrap();
        let cmds = rec.commands();
        assert_eq!(cmds.len(), 16);
        assert_eq!(cmds[0], ActuatorCommand::Angle { channel: 0, angle: 90 });
        assert_eq!(cmds[15], ActuatorCommand::Angle { channel: 15, angle: 90 });
    }

    #[test]
    fn log_actuator_accepts_everything() {
        let mut act = LogActuator::new(&Settings::default());
        act.apply(ActuatorCommand::Direction(Direction::Backward)).unwrap();
        act.apply(ActuatorCommand::Speed(70)).unwrap();
    }
}
