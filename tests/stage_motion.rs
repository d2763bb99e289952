//! Stage controller integration tests against polled mock axes.

use rust_gator::geometry::{Axis, StagePoint};
use rust_gator::hardware::adapters::{LinearAxis, TravelLimits};
use rust_gator::hardware::link::{DeviceCommand, LinkOptions};
use rust_gator::hardware::mock::{MockAxis, MockFactory};
use rust_gator::hardware::registry::{DeviceHandle, DeviceRegistry};
use rust_gator::stage::{MotionDefaults, MotionRequest, StageBuilder, StageController};
use rust_gator::{GatorError, PollingSupervisor};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

const FAST: f64 = 1000.0;
const POLL: Duration = Duration::from_millis(5);

struct Rig {
    stage: Arc<StageController>,
    x: Arc<MockAxis>,
    y: Arc<MockAxis>,
    x_handle: DeviceHandle,
    supervisor: PollingSupervisor,
}

struct RigOptions {
    speed: f64,
    x_backlash: f64,
    request_timeout: Duration,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            speed: FAST,
            x_backlash: 0.0,
            request_timeout: Duration::from_millis(100),
        }
    }
}

async fn rig_with(options: RigOptions, customize: impl FnOnce(StageBuilder) -> StageBuilder) -> Rig {
    let x = Arc::new(MockAxis::with_position_and_speed(1.0, options.speed));
    let y = Arc::new(MockAxis::with_position_and_speed(1.0, options.speed));
    let factory = MockFactory::new()
        .with_device("x_motor", x.clone())
        .with_device("y_motor", y.clone());
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(factory),
        LinkOptions {
            request_timeout: options.request_timeout,
            ..Default::default()
        },
    ));
    let supervisor = PollingSupervisor::new(registry.clone());

    let limits = TravelLimits::new(0.0, 25.0).unwrap();
    let x_handle = registry.open("x_motor").await.unwrap();
    let y_handle = registry.open("y_motor").await.unwrap();
    supervisor.start(x_handle, POLL).unwrap();
    supervisor.start(y_handle, POLL).unwrap();

    let builder = StageController::builder()
        .defaults(MotionDefaults {
            tolerance: 1e-6,
            timeout: Duration::from_secs(5),
        })
        .axis(
            LinearAxis::new(
                Axis::X,
                registry.link(x_handle).unwrap(),
                limits,
                options.x_backlash,
            )
            .unwrap(),
        )
        .axis(LinearAxis::new(Axis::Y, registry.link(y_handle).unwrap(), limits, 0.0).unwrap());
    let stage = Arc::new(customize(builder).build().unwrap());

    tokio::time::timeout(Duration::from_secs(2), async {
        while stage.current_position().is_err() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("axes never reported a position");

    Rig {
        stage,
        x,
        y,
        x_handle,
        supervisor,
    }
}

async fn rig() -> Rig {
    rig_with(RigOptions::default(), |builder| builder).await
}

fn moves(axis: &MockAxis) -> Vec<f64> {
    axis.commands()
        .into_iter()
        .filter_map(|command| match command {
            DeviceCommand::MoveAbsolute(target) => Some(target),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Settling
// =============================================================================

#[tokio::test]
async fn test_move_absolute_settles() {
    let rig = rig().await;
    rig.stage
        .move_absolute(StagePoint::new(5.0, 7.5), None, None)
        .await
        .unwrap();

    let position = rig.stage.current_position().unwrap();
    assert!((position.x - 5.0).abs() <= 1e-6);
    assert!((position.y - 7.5).abs() <= 1e-6);
    assert_eq!(moves(&rig.x), vec![5.0]);
    assert_eq!(moves(&rig.y), vec![7.5]);
}

#[tokio::test]
async fn test_zero_timeout() {
    let rig = rig().await;

    // already there: settled before the deadline is checked
    rig.stage
        .move_absolute(StagePoint::new(1.0, 1.0), None, Some(Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(
        rig.stage
            .move_absolute(StagePoint::new(5.0, 5.0), None, Some(Duration::ZERO))
            .await,
        Err(GatorError::Timeout(Duration::ZERO))
    );
}

#[tokio::test]
async fn test_slow_axis_times_out() {
    let rig = rig_with(
        RigOptions {
            speed: 1.0,
            ..Default::default()
        },
        |builder| builder,
    )
    .await;

    let timeout = Duration::from_millis(50);
    assert_eq!(
        rig.stage
            .move_absolute(StagePoint::new(20.0, 1.0), None, Some(timeout))
            .await,
        Err(GatorError::Timeout(timeout))
    );
    let x = rig.stage.current_position().unwrap().x;
    assert!(x > 1.0 && x < 20.0);
}

#[tokio::test]
async fn test_move_relative_and_jog() {
    let rig = rig().await;
    rig.stage
        .move_relative(StagePoint::new(0.5, -0.25), None, None)
        .await
        .unwrap();
    let position = rig.stage.current_position().unwrap();
    assert!((position.x - 1.5).abs() <= 1e-6);
    assert!((position.y - 0.75).abs() <= 1e-6);

    rig.stage.jog(Axis::Y, 2.0, None, None).await.unwrap();
    let position = rig.stage.current_position().unwrap();
    assert!((position.y - 2.75).abs() <= 1e-6);
    assert!((position.x - 1.5).abs() <= 1e-6);
    assert_eq!(moves(&rig.x).len(), 1);
}

// =============================================================================
// Rejection
// =============================================================================

#[tokio::test]
async fn test_out_of_range_sends_nothing() {
    let rig = rig().await;
    let result = rig
        .stage
        .move_absolute(StagePoint::new(30.0, 1.0), None, None)
        .await;
    assert!(matches!(
        result,
        Err(GatorError::OutOfRange { ref axis, .. }) if axis == "x"
    ));
    // the in-range Y target was not dispatched either
    assert!(rig.x.commands().is_empty());
    assert!(rig.y.commands().is_empty());
}

#[tokio::test]
async fn test_closed_link_rejects_request() {
    let rig = rig().await;
    rig.supervisor.registry().close(rig.x_handle).await;

    assert_eq!(
        rig.stage
            .move_absolute(StagePoint::new(2.0, 2.0), None, None)
            .await,
        Err(GatorError::NotConnected("x_motor".into()))
    );
    assert!(rig.y.commands().is_empty());
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn test_stop_cancels_in_flight_move() {
    let rig = rig_with(
        RigOptions {
            speed: 2.0,
            ..Default::default()
        },
        |builder| builder,
    )
    .await;

    let stage = rig.stage.clone();
    let motion = tokio::spawn(async move {
        stage
            .move_absolute(StagePoint::new(20.0, 20.0), None, None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = rig.stage.stop().await;
    assert!(report.is_success());

    let outcome = tokio::time::timeout(Duration::from_secs(1), motion)
        .await
        .expect("stop did not release the waiter")
        .unwrap();
    assert_eq!(outcome, Err(GatorError::Cancelled));

    assert_eq!(rig.x.commands().last(), Some(&DeviceCommand::Stop));
    let frozen = rig.x.simulated_position();
    assert!(frozen < 20.0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.x.simulated_position(), frozen);
}

#[tokio::test]
async fn test_device_error_fails_the_waiting_move() {
    let rig = rig_with(
        RigOptions {
            speed: 2.0,
            ..Default::default()
        },
        |builder| builder,
    )
    .await;
    // an error from before the move does not count against it
    rig.y.report_error(0x01);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stage = rig.stage.clone();
    let motion = tokio::spawn(async move {
        stage
            .move_absolute(StagePoint::new(20.0, 20.0), None, None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    rig.x.report_error(0x42);

    let outcome = tokio::time::timeout(Duration::from_secs(1), motion)
        .await
        .expect("device error did not release the waiter")
        .unwrap();
    assert_eq!(
        outcome,
        Err(GatorError::DeviceError {
            device: "x_motor".into(),
            code: 0x42
        })
    );
}

#[tokio::test]
#[traced_test]
async fn test_stop_reaches_every_axis() {
    let rig = rig().await;
    rig.x.set_unreachable(true);

    let report = rig.stage.stop().await;
    assert!(!report.is_success());
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Axis::X);
    assert!(matches!(failures[0].1, GatorError::Io { .. }));

    assert_eq!(rig.y.commands(), vec![DeviceCommand::Stop]);
    assert!(logs_contain("Stop failed"));
}

#[tokio::test]
async fn test_requests_after_stop_run_normally() {
    let rig = rig().await;
    rig.stage.stop().await;
    rig.stage
        .move_absolute(StagePoint::new(3.0, 3.0), None, None)
        .await
        .unwrap();
}

// =============================================================================
// Backlash
// =============================================================================

#[tokio::test]
async fn test_backlash_approach_from_below() {
    let rig = rig_with(
        RigOptions {
            x_backlash: 0.1,
            ..Default::default()
        },
        |builder| builder,
    )
    .await;

    rig.stage
        .execute(MotionRequest::new().axis(Axis::X, 0.5))
        .await
        .unwrap();

    let targets = moves(&rig.x);
    assert_eq!(targets.len(), 2);
    assert!((targets[0] - 0.35).abs() < 1e-12);
    assert_eq!(targets[1], 0.5);
    assert!((rig.x.simulated_position() - 0.5).abs() <= 1e-6);

    // moving up needs no overshoot
    rig.stage
        .execute(MotionRequest::new().axis(Axis::X, 2.0))
        .await
        .unwrap();
    assert_eq!(moves(&rig.x).len(), 3);
}

#[tokio::test]
async fn test_backlash_overshoot_clamped_to_travel() {
    let rig = rig_with(
        RigOptions {
            x_backlash: 0.1,
            ..Default::default()
        },
        |builder| builder,
    )
    .await;

    rig.stage
        .execute(MotionRequest::new().axis(Axis::X, 0.05))
        .await
        .unwrap();
    assert_eq!(moves(&rig.x), vec![0.0, 0.05]);
}

// =============================================================================
// Faults
// =============================================================================

#[tokio::test]
async fn test_faulted_device_aborts_wait() {
    let rig = rig_with(
        RigOptions {
            request_timeout: Duration::from_millis(10),
            ..Default::default()
        },
        |builder| builder,
    )
    .await;

    rig.x.set_silent(true);
    rig.supervisor
        .enable_liveness(rig.x_handle, Duration::from_millis(30))
        .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        rig.stage
            .move_absolute(StagePoint::new(10.0, 10.0), None, None),
    )
    .await
    .expect("fault was not detected");
    assert_eq!(outcome, Err(GatorError::Faulted("x_motor".into())));
}

// =============================================================================
// Named positions and homing
// =============================================================================

#[tokio::test]
async fn test_load_and_unload_positions() {
    let loaded = BTreeMap::from([(Axis::X, 12.5), (Axis::Y, 24.0)]);
    let unloaded = BTreeMap::from([(Axis::Y, 0.5)]);
    let rig = rig_with(RigOptions::default(), move |builder| {
        builder.loaded_position(loaded).unloaded_position(unloaded)
    })
    .await;

    rig.stage.load().await.unwrap();
    let position = rig.stage.current_position().unwrap();
    assert!((position.x - 12.5).abs() <= 1e-6);
    assert!((position.y - 24.0).abs() <= 1e-6);

    rig.stage.unload().await.unwrap();
    let position = rig.stage.current_position().unwrap();
    assert!((position.x - 12.5).abs() <= 1e-6);
    assert!((position.y - 0.5).abs() <= 1e-6);
}

#[tokio::test]
async fn test_unconfigured_load_is_rejected() {
    let rig = rig().await;
    assert!(matches!(
        rig.stage.load().await,
        Err(GatorError::InvalidParameter(_))
    ));
    assert!(rig.x.commands().is_empty());
}

#[tokio::test]
async fn test_home_all() {
    let rig = rig().await;
    let report = rig.stage.home_all().await;
    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(rig.x.commands(), vec![DeviceCommand::Home]);
    assert_eq!(rig.y.commands(), vec![DeviceCommand::Home]);
}
