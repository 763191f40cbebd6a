//! Integration tests for brake control through the shared device

use std::sync::Arc;

use serde_json::json;
use turbine_sync::hal::{MockDelay, MockMqtt, MockServo};
use turbine_sync::{
    BrakeAction, BrakeController, BrakePosition, BrakeState, Config, ShadowReporter,
    ShadowTarget, ShadowUpdater, SharedDevice, Topics,
};

const UPDATE: &str = "$aws/things/t1/shadow/update";

type Device = SharedDevice<MockServo, MockDelay>;

fn setup() -> (Arc<Device>, ShadowUpdater<MockMqtt, MockDelay>, MockMqtt, MockDelay) {
    let config = Config::default().with_thing_name("t1");
    let brake = BrakeController::new(MockServo::new(), MockDelay::new(), config.brake_settings());
    let device = Arc::new(SharedDevice::new(brake, &config));
    let mqtt = MockMqtt::new();
    let retry_delay = MockDelay::new();
    let updater = ShadowUpdater::new(
        mqtt.clone(),
        retry_delay.clone(),
        &Topics::new(&config.identity()),
        config.retry_policy(),
    );
    (device, updater, mqtt, retry_delay)
}

fn movements(device: &Device) -> usize {
    device.with_brake(|b| b.servo().movement_count())
}

#[test]
fn repeated_on_moves_and_reports_once() {
    let (device, mut updater, mqtt, _) = setup();

    for _ in 0..2 {
        let state = device.with_brake(|b| b.transition(BrakeAction::On, &mut updater));
        assert_eq!(state, BrakeState::On);
    }

    assert_eq!(movements(&device), 1);
    let reports = mqtt.published_to(UPDATE);
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].json(),
        json!({"state": {"reported": {"brake_status": "ON"}}})
    );
}

#[test]
fn repeated_off_moves_and_reports_once() {
    let (device, mut updater, mqtt, _) = setup();

    device.with_brake(|b| b.transition(BrakeAction::Off, &mut updater));
    device.with_brake(|b| b.transition(BrakeAction::Off, &mut updater));

    assert_eq!(movements(&device), 1);
    assert_eq!(mqtt.published_to(UPDATE).len(), 1);
    assert_eq!(device.snapshot().brake_state, BrakeState::Off);
}

#[test]
fn on_then_off_alternates() {
    let (device, mut updater, mqtt, _) = setup();

    device.with_brake(|b| b.transition(BrakeAction::On, &mut updater));
    device.with_brake(|b| b.transition(BrakeAction::Off, &mut updater));

    let writes = device.with_brake(|b| b.servo().writes());
    assert_eq!(writes, vec![6.5, 0.0, 7.5, 0.0]);
    let values: Vec<_> = mqtt
        .published_to(UPDATE)
        .iter()
        .map(|m| m.json()["state"]["reported"]["brake_status"].clone())
        .collect();
    assert_eq!(values, vec![json!("ON"), json!("OFF")]);
}

#[test]
fn state_mirrors_into_snapshot() {
    let (device, mut updater, _, _) = setup();
    assert_eq!(device.snapshot().brake_state, BrakeState::Unknown);

    device.with_brake(|b| b.transition(BrakeAction::On, &mut updater));

    let snapshot = device.snapshot();
    assert_eq!(snapshot.brake_state, BrakeState::On);
    assert_eq!(snapshot.brake_position, 6.5);
}

// ============================================================================
// Failed reports
// ============================================================================

#[test]
fn failed_report_keeps_actuation() {
    let (device, mut updater, mqtt, retry_delay) = setup();
    mqtt.set_failing(true);

    let state = device.with_brake(|b| b.transition(BrakeAction::On, &mut updater));

    assert_eq!(state, BrakeState::On);
    assert_eq!(device.snapshot().brake_state, BrakeState::On);
    assert_eq!(mqtt.attempts(), 11);
    assert_eq!(retry_delay.history(), vec![1000; 10]);
    assert!(mqtt.published().is_empty());
}

#[test]
fn abandoned_report_leaves_state_untouched() {
    let (device, mut updater, mqtt, _) = setup();
    device.with_brake(|b| b.transition(BrakeAction::On, &mut updater));
    let before = device.snapshot();

    mqtt.set_failing(true);
    let echoed = updater.report_local_change("vibe_limit", json!(3.0), ShadowTarget::Reported);

    assert_eq!(echoed, json!(3.0));
    assert_eq!(device.snapshot(), before);
}

#[test]
fn report_recovers_after_transient_failures() {
    let (device, mut updater, mqtt, retry_delay) = setup();
    mqtt.fail_next(2);

    device.with_brake(|b| b.transition(BrakeAction::Off, &mut updater));

    assert_eq!(mqtt.attempts(), 3);
    assert_eq!(retry_delay.history(), vec![1000, 1000]);
    assert_eq!(mqtt.published_to(UPDATE).len(), 1);
}

// ============================================================================
// Positional moves
// ============================================================================

#[test]
fn percent_mapping_endpoints_and_order() {
    let (device, _, _, _) = setup();
    device.with_brake(|b| {
        assert_eq!(b.resolve(BrakePosition::Percent(0.0)), 7.5);
        assert_eq!(b.resolve(BrakePosition::Percent(100.0)), 6.5);

        let mut previous = b.resolve(BrakePosition::Percent(0.0));
        for pct in (5..=100).step_by(5) {
            let duty = b.resolve(BrakePosition::Percent(pct as f32));
            assert!(duty <= previous, "{pct}% moved away from the on-position");
            previous = duty;
        }
    });
}

#[test]
fn timed_move_keeps_stable_state_and_reports_nothing() {
    let (device, mut updater, mqtt, _) = setup();
    device.with_brake(|b| b.transition(BrakeAction::Off, &mut updater));
    mqtt.clear();

    device
        .with_brake(|b| b.request_timed_move(BrakePosition::Percent(50.0), 2.0, true))
        .unwrap();

    let snapshot = device.snapshot();
    assert_eq!(snapshot.brake_state, BrakeState::Off);
    assert_eq!(snapshot.brake_position, 7.5);
    assert!(mqtt.published().is_empty());
}
