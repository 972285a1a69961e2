//! Counter/timer and 0D acquisitions driven through the pool.

use sardana_core::{PoolConfig, Propagate, RecordingListener, State};
use sardana_driver_mock::{
    ControllerCall, DummyCounterTimerConfig, DummyCounterTimerController, DummyZeroDController,
};
use sardana_pool::{AcquisitionRequest, Action, Pool, PoolElement, WorkerPool};
use std::sync::Arc;
use tokio::runtime::Handle;

fn pool() -> Pool {
    Pool::new(PoolConfig::default(), WorkerPool::new(Handle::current(), 4))
}

#[tokio::test]
async fn test_timer_on_second_card_loads_both_cards() {
    let pool = pool();
    let card_a = DummyCounterTimerController::new();
    let card_b = DummyCounterTimerController::new();
    pool.add_controller("ctctrl_a", Box::new(card_a.clone())).unwrap();
    pool.add_controller("ctctrl_b", Box::new(card_b.clone())).unwrap();
    let a1 = pool.add_ct_channel("ct_a1", "ctctrl_a", 1).await.unwrap();
    let a2 = pool.add_ct_channel("ct_a2", "ctctrl_a", 2).await.unwrap();
    let timer = pool.add_ct_channel("timer", "ctctrl_b", 1).await.unwrap();

    let acquisition = pool.acquisition("acq01").unwrap();
    acquisition
        .acquire(AcquisitionRequest {
            integ_time: Some(0.5),
            monitor_count: None,
            master: Some(timer.id()),
        })
        .await
        .unwrap();

    let calls_b = card_b.calls();
    assert_eq!(calls_b.count(|c| *c == ControllerCall::LoadOne(1, 0.5)), 1);
    assert_eq!(calls_b.count(|c| c.is_start_all()), 1);
    let calls_a = card_a.calls();
    assert_eq!(calls_a.count(|c| *c == ControllerCall::LoadOne(1, 0.5)), 1);
    assert_eq!(calls_a.count(|c| c.is_start_one()), 2);
    assert_eq!(calls_a.count(|c| c.is_start_all()), 1);

    assert_eq!(timer.value(), Some(0.5));
    assert_eq!(a2.value(), Some(100.0));
    for channel in [&a1, &a2, &timer] {
        assert_eq!(channel.core().state(), State::On);
        assert!(!channel.core().is_in_operation());
    }
}

#[tokio::test]
async fn test_monitor_preset_is_loaded_negative() {
    let pool = pool();
    let card = DummyCounterTimerController::new();
    pool.add_controller("ctctrl01", Box::new(card.clone())).unwrap();
    let ct01 = pool.add_ct_channel("ct01", "ctctrl01", 1).await.unwrap();
    let monitor = pool.add_ct_channel("monitor", "ctctrl01", 2).await.unwrap();

    let acquisition = pool.acquisition("acq01").unwrap();
    acquisition
        .acquire(AcquisitionRequest::monitored(1000.0, monitor.id()))
        .await
        .unwrap();

    assert_eq!(
        card.calls().count(|c| *c == ControllerCall::LoadOne(2, -1000.0)),
        1
    );
    assert_eq!(monitor.value(), Some(1000.0));
    assert_eq!(ct01.value(), Some(500.0));
}

#[tokio::test]
async fn test_refused_load_starts_nothing() {
    let pool = pool();
    let card = DummyCounterTimerController::new();
    pool.add_controller("ctctrl01", Box::new(card.clone())).unwrap();
    let ct01 = pool.add_ct_channel("ct01", "ctctrl01", 1).await.unwrap();
    card.refuse_load(1);
    card.calls().clear();

    let err = ct01.start_acquisition(Some(1.0)).await.unwrap_err();
    assert_eq!(err.to_string(), "ctctrl01.PreLoadOne(1, 1) returns False");
    assert_eq!(card.calls().count(|c| c.is_start_one()), 0);
    assert!(!ct01.core().is_in_operation());
}

#[tokio::test]
async fn test_zerod_slaves_follow_counter_timer() {
    let pool = pool();
    let card = DummyCounterTimerController::new();
    let zerod_ctrl = DummyZeroDController::new();
    pool.add_controller("ctctrl01", Box::new(card)).unwrap();
    pool.add_controller("zerodctrl01", Box::new(zerod_ctrl.clone())).unwrap();
    let timer = pool.add_ct_channel("timer", "ctctrl01", 1).await.unwrap();
    let zerod = pool.add_zerod_channel("zerod01", "zerodctrl01", 1).await.unwrap();
    zerod_ctrl.script_values(1, [2.0, 4.0]);

    let events = Arc::new(RecordingListener::default());
    zerod.core().add_listener(&events);

    let acquisition = pool.acquisition("acq01").unwrap();
    acquisition.acquire(AcquisitionRequest::timed(0.2)).await.unwrap();

    assert!(!acquisition.is_running());
    assert_eq!(timer.value(), Some(0.2));
    let buffer = zerod.value_buffer();
    assert!(buffer.len() >= 2, "{:?}", buffer);
    assert_eq!(&buffer[..2], &[2.0, 4.0]);
    let value = zerod.value().unwrap();
    assert!((2.0..=4.0).contains(&value), "{}", value);
    assert_eq!(zerod.core().state(), State::On);
    assert!(!zerod.core().is_in_operation());

    let values = events.events_named("value");
    let last = values.last().unwrap();
    assert_eq!(last.event_type.priority, Propagate::Force.priority());
    assert_eq!(last.value.as_scalar(), Some(value));
}

#[tokio::test]
async fn test_abort_freezes_counts() {
    let pool = pool();
    let card = DummyCounterTimerController::with_config(DummyCounterTimerConfig {
        settle_polls: 10_000,
        ..Default::default()
    });
    pool.add_controller("ctctrl01", Box::new(card.clone())).unwrap();
    let ct01 = pool.add_ct_channel("ct01", "ctctrl01", 1).await.unwrap();

    ct01.start_acquisition(Some(10.0)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    ct01.abort().await.unwrap();
    ct01.acquisition().core().wait_finished().await;

    assert!(!card.is_acquiring());
    assert_eq!(ct01.core().state(), State::On);
    let value = ct01.value().unwrap();
    assert!(value < 10.0, "{}", value);
}

#[tokio::test]
async fn test_offline_controller_rejects_start() {
    let pool = pool();
    let card = DummyCounterTimerController::new();
    pool.add_controller("ctctrl01", Box::new(card.clone())).unwrap();
    let ct01 = pool.add_ct_channel("ct01", "ctctrl01", 1).await.unwrap();
    ct01.controller()
        .set_ctrl_error(Some("card unplugged".to_string()));

    let err = ct01.start_acquisition(Some(1.0)).await.unwrap_err();
    assert!(err.to_string().contains("offline"), "{}", err);
    assert!(!ct01.core().is_in_operation());
}
