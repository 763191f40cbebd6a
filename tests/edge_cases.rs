//! Edge case and boundary condition tests for the turbine monitor

use std::sync::Arc;

use serde_json::json;
use turbine_sync::hal::{MockAccelerometer, MockAdc, MockDelay, MockMqtt, MockServo};
use turbine_sync::messages::{parse_brake_command, parse_delta};
use turbine_sync::{
    BrakeController, BrakePosition, Config, ConfigError, RetryPolicy, RotationCounter,
    SafetyLevel, SensorSampler, ShadowTarget, ShadowUpdater, Topics, Vector3, VibrationStats,
};

// ============================================================================
// Safety Boundaries
// ============================================================================

#[test]
fn peak_equal_to_limit_is_not_unsafe() {
    assert_ne!(SafetyLevel::evaluate(5.0, 5.0), SafetyLevel::Unsafe);
    assert_eq!(SafetyLevel::evaluate(5.0, 5.0), SafetyLevel::Warning);
}

#[test]
fn warning_band_starts_at_eighty_percent() {
    let limit = 5.0_f32;
    let edge = limit * 0.8;
    assert_eq!(SafetyLevel::evaluate(edge, limit), SafetyLevel::Warning);
    assert_eq!(SafetyLevel::evaluate(edge - 1e-3, limit), SafetyLevel::Safe);
}

#[test]
fn just_above_limit_is_unsafe() {
    assert_eq!(SafetyLevel::evaluate(5.0001, 5.0), SafetyLevel::Unsafe);
}

#[test]
fn zero_peak_is_safe() {
    assert_eq!(SafetyLevel::evaluate(0.0, 5.0), SafetyLevel::Safe);
}

// ============================================================================
// Rotation
// ============================================================================

#[test]
fn unchanged_counter_reads_zero_rpm() {
    let counter = Arc::new(RotationCounter::new());
    let mut sampler = SensorSampler::new(
        Arc::clone(&counter),
        MockAccelerometer::new(),
        MockAdc::with_raw(0),
    );

    counter.record_pulse_at(2_000_000);
    assert_eq!(sampler.calculate_speed(), 60_000_000.0 / 2_000_000.0);
    assert_eq!(sampler.calculate_speed(), 0.0);
    assert_eq!(sampler.calculate_speed(), 0.0);
}

#[test]
fn pulses_at_same_instant_do_not_divide_by_zero() {
    let counter = Arc::new(RotationCounter::new());
    let mut sampler = SensorSampler::new(
        Arc::clone(&counter),
        MockAccelerometer::new(),
        MockAdc::with_raw(0),
    );
    counter.record_pulse_at(0);

    assert_eq!(sampler.calculate_speed(), 0.0);
}

#[test]
fn magnitude_uses_all_axes() {
    let stats = VibrationStats::from_samples(&[
        Vector3::new(3.0, 4.0, 0.0),
        Vector3::new(0.0, 0.0, -2.0),
    ]);
    assert_eq!(stats.peak, 5.0);
    assert_eq!(stats.peak_z, 2.0);
    assert_eq!(stats.average, 3.5);
    assert_eq!(stats.sample_count, 2);
}

// ============================================================================
// Brake Positions
// ============================================================================

fn brake() -> BrakeController<MockServo, MockDelay> {
    BrakeController::new(
        MockServo::new(),
        MockDelay::new(),
        Config::default().brake_settings(),
    )
}

#[test]
fn percent_outside_range_is_clamped() {
    let brake = brake();
    assert_eq!(brake.resolve(BrakePosition::Percent(-20.0)), 7.5);
    assert_eq!(brake.resolve(BrakePosition::Percent(250.0)), 6.5);
}

#[test]
fn non_finite_positions_fall_back_to_off() {
    let brake = brake();
    assert_eq!(brake.resolve(BrakePosition::Percent(f32::NAN)), 7.5);
    assert_eq!(brake.resolve(BrakePosition::Duty(f32::INFINITY)), 7.5);
}

#[test]
fn raw_duty_is_clamped_to_servo_range() {
    let brake = brake();
    assert_eq!(brake.resolve(BrakePosition::Duty(0.5)), 2.5);
    assert_eq!(brake.resolve(BrakePosition::Duty(99.0)), 12.5);
}

#[test]
fn zero_hold_still_returns_to_off() {
    let delay = MockDelay::new();
    let mut brake = BrakeController::new(
        MockServo::new(),
        delay.clone(),
        Config::default().brake_settings(),
    );

    brake
        .request_timed_move(BrakePosition::Duty(7.0), 0.0, true)
        .unwrap();

    assert_eq!(brake.servo().writes(), vec![7.0, 7.5, 0.0]);
    assert_eq!(delay.history(), vec![0, 500]);
}

// ============================================================================
// Payload Boundaries
// ============================================================================

#[test]
fn empty_delta_state_changes_nothing() {
    assert!(parse_delta(br#"{"state": {}}"#).unwrap().is_empty());
}

#[test]
fn zero_interval_is_rejected() {
    assert!(parse_delta(br#"{"state": {"data_fast_interval": 0}}"#).is_err());
    assert!(parse_delta(br#"{"state": {"data_fast_interval": 1.5}}"#).is_err());
}

#[test]
fn non_positive_limits_are_rejected() {
    assert!(parse_delta(br#"{"state": {"vibe_limit": 0}}"#).is_err());
    assert!(parse_delta(br#"{"state": {"vibe_limit": -1}}"#).is_err());
    assert!(parse_delta(br#"{"state": {"brake_on_pwm": null}}"#).is_err());
}

#[test]
fn unknown_brake_status_is_rejected() {
    assert!(parse_delta(br#"{"state": {"brake_status": "HALF"}}"#).is_err());
}

#[test]
fn negative_hold_is_rejected() {
    assert!(parse_brake_command(br#"{"pwm_value": 7.0, "duration_sec": -1}"#).is_err());
}

#[test]
fn hold_defaults_to_one_second() {
    let command = parse_brake_command(br#"{"brake_pct": "25"}"#).unwrap();
    assert_eq!(command.position, BrakePosition::Percent(25.0));
    assert_eq!(command.duration_secs, 1.0);
    assert!(command.return_to_off);
}

#[test]
fn command_array_is_rejected() {
    assert!(parse_brake_command(b"[1, 2]").is_err());
}

// ============================================================================
// Retry Ceiling
// ============================================================================

#[test]
fn zero_retries_attempts_once_without_sleeping() {
    let mqtt = MockMqtt::new();
    let delay = MockDelay::new();
    let topics = Topics::new(&Config::default().with_thing_name("t1").identity());
    let mut updater = ShadowUpdater::new(
        mqtt.clone(),
        delay.clone(),
        &topics,
        RetryPolicy {
            max_retries: 0,
            retry_delay_ms: 1000,
        },
    );
    mqtt.set_failing(true);

    assert!(!updater.publish_update("vibe_limit", &json!(4.0), ShadowTarget::Reported));
    assert_eq!(mqtt.attempts(), 1);
    assert!(delay.history().is_empty());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn config_rejects_inverted_duty_range() {
    let mut config = Config::default();
    config.settings.brake_servo.min_duty = 12.5;
    config.settings.brake_servo.max_duty = 2.5;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
}

#[test]
fn config_rejects_on_position_outside_range() {
    let config = Config::default().with_brake_positions(20.0, 7.5);
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "settings.brakeServo.onPosition",
            ..
        })
    ));
}

#[test]
fn config_requires_greengrass_host() {
    let mut config = Config::default();
    config.runtime.connection.use_greengrass = true;
    assert!(config.validate().is_err());
    assert!(config.with_greengrass("gg.local").validate().is_ok());
}

#[test]
fn config_rejects_zero_sample_count() {
    assert!(Config::default().with_sample_count(0).validate().is_err());
}
