//! Process-level behaviour, driven through the real `autorc` binary.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use autorc::config::Settings;
use autorc::context::{Context, ContextError};
use autorc::secret::SharedSecret;
use autorc::vehicle::{ContextSource, UnitOutcome, Vehicle, VehicleError, VehicleOptions};
use serde_json::{Value, json};
use unit_plugin::message::LogLevel;

const BIN: &str = env!("CARGO_BIN_EXE_autorc");

fn options() -> VehicleOptions {
    let mut opts = VehicleOptions::with_program(BIN, &Settings::default());
    opts.log_level = LogLevel::Warn;
    opts.grace_period = Duration::from_secs(2);
    opts
}

async fn wait_until(ctx: &dyn Context, key: &str, done: impl Fn(&Value) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done(&ctx.get(key).await.unwrap()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for(ctx: &dyn Context, key: &str, expected: Value) -> bool {
    wait_until(ctx, key, |v| *v == expected).await
}

async fn wait_past(ctx: &dyn Context, key: &str, n: u64) -> bool {
    wait_until(ctx, key, |v| v.as_u64().is_some_and(|v| v >= n)).await
}

#[tokio::test]
async fn constant_feeds_increment_across_processes() {
    let mut vehicle = Vehicle::new(options());
    vehicle
        .register("constant", json!({"value": 42, "process_rate": 50.0}))
        .register("increment", json!({"process_rate": 50.0}));

    let report = vehicle
        .start_with(|h| async move {
            assert_eq!(h.units, vec!["constant-0", "increment-1"]);
            assert!(wait_for(h.context.as_ref(), "result", json!(43)).await);
            let ts = h.context.timestamp("result").await.unwrap();
            assert!(ts.is_some());
        })
        .await
        .unwrap();

    assert_eq!(report.units.len(), 2);
    for unit in &report.units {
        assert_eq!(unit.outcome, UnitOutcome::Stopped { code: Some(0) }, "{}", unit.unit_id);
    }
}

#[tokio::test]
async fn every_unit_is_gone_within_the_grace_period() {
    let mut vehicle = Vehicle::new(options());
    vehicle
        .register("counter", json!({"process_rate": 5.0}))
        .register("counter", json!({"output": "other", "process_rate": 5.0}));

    let stopping_at = OnceLock::new();
    let stamp = &stopping_at;
    let report = vehicle
        .start_with(|h| async move {
            assert!(wait_past(h.context.as_ref(), "count", 2).await);
            assert!(wait_past(h.context.as_ref(), "other", 2).await);
            let _ = stamp.set(Instant::now());
        })
        .await
        .unwrap();

    let elapsed = stopping_at.get().unwrap().elapsed();
    assert!(elapsed < Duration::from_secs(2), "shutdown took {elapsed:?}");
    assert_eq!(report.killed().count(), 0);
    assert_eq!(report.crashed().count(), 0);
}

#[tokio::test]
async fn a_crashing_unit_leaves_the_others_running() {
    let mut vehicle = Vehicle::new(options());
    vehicle
        .register("faulty", json!({"after": 2, "process_rate": 20.0}))
        .register("counter", json!({"process_rate": 20.0}));

    let report = vehicle
        .start_with(|h| async move {
            // faulty is long dead by the time the counter reaches 20
            assert!(wait_past(h.context.as_ref(), "count", 20).await);
            let seen = h.context.get("count").await.unwrap().as_u64().unwrap();
            assert!(wait_past(h.context.as_ref(), "count", seen + 5).await);
        })
        .await
        .unwrap();

    assert_eq!(report.outcome("faulty-0"), Some(UnitOutcome::FinishedEarly { code: Some(1) }));
    assert_eq!(report.outcome("counter-1"), Some(UnitOutcome::Stopped { code: Some(0) }));
    assert_eq!(report.crashed().map(|u| u.unit_id.as_str()).collect::<Vec<_>>(), vec!["faulty-0"]);
}

#[tokio::test]
async fn unknown_node_type_aborts_startup() {
    let mut vehicle = Vehicle::new(options());
    vehicle
        .register("counter", Value::Null)
        .register("warp-drive", Value::Null);

    let mut controlled = false;
    let err = vehicle
        .start_with(|_| {
            controlled = true;
            async {}
        })
        .await
        .unwrap_err();

    assert!(!controlled);
    match err {
        VehicleError::UnitInit { unit, reason } => {
            assert_eq!(unit, "warp-drive-1");
            assert!(reason.contains("warp-drive"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn secondary_vehicle_shares_the_primary_context() {
    let mut primary = Vehicle::new(options());
    primary.register("constant", json!({"value": 41, "process_rate": 50.0}));

    let report = primary
        .start_with(|h| async move {
            let mut opts = options();
            opts.name = "Trailer".into();
            opts.context = ContextSource::Remote { address: h.address.clone() };
            opts.secret = Some(h.secret.clone());
            let mut secondary = Vehicle::new(opts);
            secondary.register("increment", json!({"process_rate": 50.0}));

            let primary_ctx = h.context.clone();
            let report = secondary
                .start_with(|s| async move {
                    assert_eq!(s.context.get("vehicle_name").await.unwrap(), json!("NoahCar"));
                    assert!(wait_for(primary_ctx.as_ref(), "result", json!(42)).await);
                })
                .await
                .unwrap();
            assert_eq!(report.vehicle, "Trailer");
            assert_eq!(report.killed().count(), 0);
        })
        .await
        .unwrap();
    assert_eq!(report.outcome("constant-0"), Some(UnitOutcome::Stopped { code: Some(0) }));
}

#[tokio::test]
async fn a_wrong_secret_is_fatal_to_the_secondary() {
    let primary = Vehicle::new(options());
    primary
        .start_with(|h| async move {
            let mut opts = options();
            opts.context = ContextSource::Remote { address: h.address.clone() };
            opts.secret = Some(SharedSecret::new("not-the-secret"));
            let mut secondary = Vehicle::new(opts);
            secondary.register("counter", Value::Null);

            let err = secondary.start_with(|_| async {}).await.unwrap_err();
            assert!(
                matches!(err, VehicleError::Bridge { error: ContextError::Unauthorized, .. }),
                "{err}"
            );
            // nothing from the secondary reached the primary context
            assert_eq!(h.context.get("count").await.unwrap(), Value::Null);
        })
        .await
        .unwrap();
}

#[test]
fn cli_lists_profiles() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("track.json"), r#"{"nodes": []}"#)?;
    std::fs::write(dir.path().join("garage.json"), r#"{"nodes": []}"#)?;

    let assert = Command::cargo_bin("autorc")?
        .arg("list-profile")
        .env("AUTORC_PROFILES_ROOT", dir.path())
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.starts_with("Available profiles:\n  garage\n  track\n"), "{stdout}");
    Ok(())
}

#[test]
fn cli_without_action_prints_the_actions() -> anyhow::Result<()> {
    let assert = Command::cargo_bin("autorc")?.assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("list-profile, start, reset-servo"), "{stdout}");
    Ok(())
}

#[test]
fn cli_reset_servo_parks_every_channel() -> anyhow::Result<()> {
    let assert = Command::cargo_bin("autorc")?.arg("reset-servo").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("Reset 16 servo channels to 90 degrees"), "{stdout}");
    Ok(())
}

#[test]
fn cli_start_with_a_missing_profile_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let assert = Command::cargo_bin("autorc")?
        .args(["-p", "nowhere", "start"])
        .env("AUTORC_PROFILES_ROOT", dir.path())
        .assert()
        .code(1);
    assert!(String::from_utf8_lossy(&assert.get_output().stderr).contains("nowhere"));
    Ok(())
}

#[test]
fn cli_logs_where_the_config_file_points() -> anyhow::Result<()> {
    let profiles = tempfile::tempdir()?;
    let logs = tempfile::tempdir()?;
    let config = logs.path().join("settings.json");
    std::fs::write(&config, serde_json::to_string(&json!({"LOG_DIR": logs.path(), "LOG_LEVEL": "info"}))?)?;

    Command::cargo_bin("autorc")?
        .arg("--config")
        .arg(&config)
        .arg("list-profile")
        .env("AUTORC_PROFILES_ROOT", profiles.path())
        .env_remove("AUTORC_LOG_DIR")
        .env_remove("AUTORC_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .assert()
        .success();

    let mut written = String::new();
    for entry in std::fs::read_dir(logs.path())? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with("autorc.log") {
            written.push_str(&std::fs::read_to_string(entry.path())?);
        }
    }
    assert!(written.contains("Loaded settings from"), "log dir holds: {written:?}");
    Ok(())
}
