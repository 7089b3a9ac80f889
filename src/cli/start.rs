use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tracing::{error, info};

use super::CliContext;
use autorc::config::secret_from_env;
use autorc::nodes::NodeRegistry;
use autorc::secret::SharedSecret;
use autorc::vehicle::{ContextSource, VehicleOptions, load_profile};

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Serve the context on ADDR so a second vehicle can attach, e.g. 0.0.0.0:4100
    #[arg(long, value_name = "ADDR", conflicts_with = "connect")]
    pub expose: Option<String>,

    /// Attach to the context another vehicle exposes instead of creating one
    #[arg(long, value_name = "ADDR")]
    pub connect: Option<String>,

    /// Shared secret of the context service (default: AUTORC_CONTEXT_SECRET, or random when serving)
    #[arg(long, value_name = "S")]
    pub secret: Option<String>,

    /// How long units get to stop before they are killed
    #[arg(long, value_name = "N")]
    pub grace_ms: Option<u64>,
}

impl StartArgs {
    fn apply(self, options: &mut VehicleOptions) {
        if let Some(ms) = self.grace_ms {
            options.grace_period = Duration::from_millis(ms);
        }
        options.secret = self.secret.map(SharedSecret::new).or_else(secret_from_env);
        if let Some(address) = self.connect {
            options.context = ContextSource::Remote { address };
        } else if let Some(bind) = self.expose {
            options.context = ContextSource::Local { bind };
        }
    }
}

pub async fn execute(args: StartArgs, context: &CliContext) -> anyhow::Result<i32> {
    let settings = &context.settings;
    let profile = load_profile(&settings.profiles_root, &context.profile)?;
    profile.validate(&NodeRegistry::builtin())?;

    let exposed = args.expose.is_some();
    let mut options = VehicleOptions::from_settings(settings)?;
    args.apply(&mut options);

    let vehicle = profile.into_vehicle(options);
    info!(vehicle = vehicle.name(), profile = %context.profile, nodes = vehicle.nodes().len(), "starting");

    let report = vehicle
        .start_with(|handle| async move {
            if exposed {
                println!("Context service reachable at {}", handle.address);
                println!("Shared secret: {}", handle.secret.expose());
            }
            println!("Running {} units; press Ctrl-C to stop", handle.units.len());
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("could not listen for Ctrl-C: {e}");
            }
        })
        .await
        .with_context(|| format!("vehicle for profile '{}' failed", context.profile))?;

    print!("{report}");
    Ok(if report.crashed().next().is_some() { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorc::config::Settings;

    fn options() -> VehicleOptions {
        VehicleOptions::with_program("autorc", &Settings::default())
    }

    #[test]
    fn connect_switches_to_a_remote_context() {
        let mut opts = options();
        StartArgs {
            connect: Some("10.0.0.2:4100".into()),
            secret: Some("s3cret".into()),
            grace_ms: Some(500),
            ..Default::default()
        }
        .apply(&mut opts);
        assert_eq!(opts.context, ContextSource::Remote { address: "10.0.0.2:4100".into() });
        assert_eq!(opts.grace_period, Duration::from_millis(500));
        assert!(opts.secret.unwrap().verify("s3cret"));
    }

    #[test]
    fn expose_rebinds_the_local_context() {
        let mut opts = options();
        StartArgs { expose: Some("0.0.0.0:4100".into()), ..Default::default() }.apply(&mut opts);
        assert_eq!(opts.context, ContextSource::Local { bind: "0.0.0.0:4100".into() });
    }
}
