//! Integration tests for the dummy controllers
//!
//! Drives the controllers only through the `Controller` trait object, the way
//! the pool does.

use sardana_core::{Controller, ControllerFactory, State};
use sardana_driver_mock::*;

async fn add_axes(ctrl: &mut dyn Controller, axes: &[u32]) {
    for &axis in axes {
        ctrl.add_device(axis).await.unwrap();
    }
}

/// A full motor batch through a boxed controller, as built by a factory
#[tokio::test]
async fn test_boxed_motor_batch() {
    let cfg: toml::Value = toml::from_str("settle_polls = 2").unwrap();
    let mut ctrl = DummyMotorFactory.build(cfg).unwrap();
    add_axes(ctrl.as_mut(), &[1, 2]).await;

    ctrl.pre_start_all().await.unwrap();
    assert!(ctrl.pre_start_one(1, 4.0).await.unwrap());
    assert!(ctrl.pre_start_one(2, -4.0).await.unwrap());
    ctrl.start_one(1, 4.0).await.unwrap();
    ctrl.start_one(2, -4.0).await.unwrap();
    ctrl.start_all().await.unwrap();

    let mut polls = 0;
    loop {
        ctrl.pre_state_all().await.unwrap();
        ctrl.state_all().await.unwrap();
        let s1 = ctrl.state_one(1).await.unwrap().state;
        let s2 = ctrl.state_one(2).await.unwrap().state;
        polls += 1;
        if s1 == State::On && s2 == State::On {
            break;
        }
        assert!(polls < 10, "motion never settled");
    }
    assert_eq!(polls, 2);
    assert_eq!(ctrl.read_one(1).await.unwrap(), 4.0);
    assert_eq!(ctrl.read_one(2).await.unwrap(), -4.0);
}

/// Error injection surfaces as a ControllerError inside anyhow
#[tokio::test]
async fn test_injected_failure_is_structured() {
    let handle = DummyMotorController::builder()
        .error_config(ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "start_all",
        }))
        .build();
    let mut ctrl: Box<dyn Controller> = Box::new(handle.clone());
    ctrl.add_device(1).await.unwrap();
    let err = ctrl.start_all().await.unwrap_err();
    let inner = err
        .downcast_ref::<sardana_core::ControllerError>()
        .unwrap();
    assert!(inner.is_communication());
    assert_eq!(handle.calls().count(ControllerCall::is_start_all), 1);
}

/// Scripted one-shot failures only hit the next call
#[tokio::test]
async fn test_fail_next_is_one_shot() {
    let handle = DummyMotorController::new();
    let mut ctrl: Box<dyn Controller> = Box::new(handle.clone());
    ctrl.add_device(1).await.unwrap();
    handle.fail_next("read_one");
    assert!(ctrl.read_one(1).await.is_err());
    assert!(ctrl.read_one(1).await.is_ok());
}

/// Counter/timer with a 0D controller read side by side
#[tokio::test]
async fn test_counter_and_zerod() {
    let mut ct: Box<dyn Controller> = Box::new(DummyCounterTimerController::new());
    let zerod_handle = DummyZeroDController::new();
    let mut zerod: Box<dyn Controller> = Box::new(zerod_handle.clone());
    add_axes(ct.as_mut(), &[1, 2]).await;
    add_axes(zerod.as_mut(), &[1]).await;
    zerod_handle.script_values(1, [0.5, 1.5]);

    ct.pre_load_all().await.unwrap();
    assert!(ct.pre_load_one(1, 0.3).await.unwrap());
    ct.load_one(1, 0.3).await.unwrap();
    ct.load_all().await.unwrap();
    ct.pre_start_all().await.unwrap();
    for axis in [2, 1] {
        ct.pre_start_one(axis, 0.3).await.unwrap();
        ct.start_one(axis, 0.3).await.unwrap();
    }
    ct.start_all().await.unwrap();

    let mut samples = Vec::new();
    while ct.state_one(1).await.unwrap().state == State::Moving {
        ct.state_all().await.unwrap();
        samples.push(zerod.read_one(1).await.unwrap());
    }
    assert_eq!(samples, vec![0.5, 1.5, 1.5]);
    assert!((ct.read_one(1).await.unwrap() - 0.3).abs() < 1e-12);
    assert!((ct.read_one(2).await.unwrap() - 60.0).abs() < 1e-9);
}

/// Test mock modes parse from configuration
#[test]
fn test_modes_from_config() {
    let cfg: DummyMotorConfig = toml::from_str("mode = \"chaos\"\nfailure_rate = 0.1").unwrap();
    assert_eq!(cfg.mode, MockMode::Chaos);
    let cfg: DummyCounterTimerConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.mode, MockMode::Instant);
}
