use tracing::info;

use super::CliContext;
use autorc::actuator::{LogActuator, reset_servos};

pub fn execute(context: &CliContext) -> anyhow::Result<()> {
    let settings = &context.settings;
    let mut actuator = LogActuator::new(settings);
    reset_servos(&mut actuator, settings)?;
    info!(channels = settings.servo_channels, angle = settings.neutral_angle, "servos reset");
    println!(
        "Reset {} servo channels to {} degrees",
        settings.servo_channels, settings.neutral_angle
    );
    Ok(())
}
