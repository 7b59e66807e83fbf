mod common;

use std::{sync::Arc, time::Duration};

use common::{square_frame, RelayContext, SensorContext, StaticCamera};
use pretty_assertions::assert_eq;
use robo_scanner::{
    calibration::CalibrationProfile,
    classify::ClassificationRule,
    coil::CoilClient,
    config::ActuationConfig,
    counters::GroupCounters,
    gate::ActuationGate,
    history::ScanHistory,
    laser::{AxisSource, AxisSources, DistanceSensors, LaserConfig},
    measure::{BinarizeOptions, MeasureOptions},
    orchestrator::{ScanDevices, ScanEvent, ScanOrchestrator, ScanSettings, ScanState},
    targets::{ActuationTarget, ActuationTargets},
    Dimensions, Error,
};
use test_context::test_context;
use testresult::TestResult;

fn small_parts_rule() -> ClassificationRule {
    ClassificationRule {
        index: 1,
        name: "Small".to_string(),
        active: true,
        max_x: Some(50.0),
        max_y: Some(50.0),
        max_z: Some(50.0),
        target: Some(1),
    }
}

fn scanner(
    targets: Vec<ActuationTarget>,
    axes: AxisSources,
    sensors: Option<DistanceSensors>,
    group_limit: u32,
) -> ScanOrchestrator {
    let frame = square_frame(60);
    ScanOrchestrator::new(
        ScanSettings {
            measure: MeasureOptions {
                binarize: BinarizeOptions {
                    blur_kernel: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            axes,
            profile: CalibrationProfile {
                mm_per_px_axis1: 1.0,
                mm_per_px_axis2: 1.0,
                mm_per_px_side: 1.0,
                ..Default::default()
            },
            rules: vec![small_parts_rule()],
            targets: ActuationTargets::new(targets),
            actuation: ActuationConfig {
                group_limit,
                ..Default::default()
            },
        },
        ScanDevices {
            top: Arc::new(StaticCamera(frame.clone())),
            side: Arc::new(StaticCamera(frame)),
            coil: CoilClient::default(),
            gate: ActuationGate::new(),
            sensors,
            counters: GroupCounters::in_memory(group_limit),
            history: ScanHistory::in_memory(),
        },
    )
}

#[test_context(RelayContext)]
#[tokio::test]
async fn test_scan_pulses_mapped_coil_and_arms_gate(ctx: &mut RelayContext) -> TestResult {
    let scanner = scanner(
        vec![ctx.board.target(1, 3, Some(2))],
        AxisSources::default(),
        None,
        150,
    );
    scanner.start();

    let outcome = scanner.trigger().await?;
    assert_eq!(outcome.dimensions, Dimensions::new(60.0, 60.0, 60.0));
    assert_eq!(outcome.group_index, 1);
    assert_eq!(outcome.group_name, "Small");
    assert_eq!(outcome.target, 1);
    assert_eq!(outcome.gate_window, Duration::from_secs(2));
    assert_eq!(outcome.counter.count, 1);
    assert_eq!(scanner.state(), ScanState::Idle);

    let writes = ctx.board.writes();
    assert_eq!(
        writes.iter().map(|w| (w.address, w.value)).collect::<Vec<_>>(),
        vec![(2, true), (2, false)]
    );
    let held = writes[1].at - writes[0].at;
    assert!(held >= Duration::from_millis(1900), "relay held for {held:?}");

    assert!(scanner.gate().is_busy());
    assert!(scanner.gate().remaining() > Duration::from_millis(1500));
    assert!(matches!(scanner.trigger().await, Err(Error::GateBusy { .. })));
    assert_eq!(ctx.board.writes().len(), 2);

    Ok(())
}

#[test_context(RelayContext)]
#[tokio::test]
async fn test_release_target_follows_mapped_pulse(ctx: &mut RelayContext) -> TestResult {
    let scanner = scanner(
        vec![ctx.board.target(1, 3, Some(1)), ctx.board.target(16, 16, None)],
        AxisSources::default(),
        None,
        150,
    );
    scanner.start();

    let outcome = scanner.trigger().await?;
    assert_eq!(outcome.gate_window, Duration::from_secs(1));

    let writes = ctx.board.writes();
    assert_eq!(
        writes.iter().map(|w| (w.address, w.value)).collect::<Vec<_>>(),
        vec![(2, true), (2, false), (15, true), (15, false)]
    );
    assert!(writes[3].at - writes[2].at >= Duration::from_millis(900));

    Ok(())
}

#[test_context(RelayContext)]
#[tokio::test]
async fn test_full_bin_pauses_line(ctx: &mut RelayContext) -> TestResult {
    let scanner = scanner(
        vec![ctx.board.target(1, 3, Some(1))],
        AxisSources::default(),
        None,
        1,
    );
    let mut events = scanner.subscribe();
    scanner.start();

    let outcome = scanner.trigger().await?;
    assert!(outcome.counter.is_full());
    assert_eq!(scanner.state(), ScanState::Paused);
    assert!(!scanner.is_running());

    let mut full = None;
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::GroupFull { group_index, name } = event {
            full = Some((group_index, name));
        }
    }
    assert_eq!(full, Some((1, "Small".to_string())));

    scanner.reset_counter(1);
    assert_eq!(scanner.counters()[0].count, 0);

    Ok(())
}

#[test_context(RelayContext)]
#[tokio::test]
async fn test_unreachable_board_pauses_and_counts(ctx: &mut RelayContext) -> TestResult {
    let mut target = ctx.board.target(1, 3, Some(1));
    target.port = portpicker::pick_unused_port().ok_or("no port available")?;
    let scanner = scanner(vec![target], AxisSources::default(), None, 150);
    scanner.start();

    let err = scanner.trigger().await.unwrap_err();
    assert!(matches!(err, Error::ProtocolIo { value: true, .. }), "{err:?}");
    assert_eq!(scanner.state(), ScanState::Paused);
    assert_eq!(scanner.counters()[0].count, 1);
    assert!(scanner.gate().is_busy());

    Ok(())
}

#[test_context(RelayContext)]
#[tokio::test]
async fn test_release_fires_after_failed_mapped_pulse(ctx: &mut RelayContext) -> TestResult {
    let mut mapped = ctx.board.target(1, 3, Some(1));
    mapped.port = portpicker::pick_unused_port().ok_or("no port available")?;
    let scanner = scanner(vec![mapped, ctx.board.target(16, 16, None)], AxisSources::default(), None, 150);
    scanner.start();

    let err = scanner.trigger().await.unwrap_err();
    assert!(matches!(err, Error::ProtocolIo { value: true, .. }), "{err:?}");
    assert_eq!(scanner.state(), ScanState::Paused);

    let writes = ctx.board.writes();
    assert_eq!(
        writes.iter().map(|w| (w.address, w.value)).collect::<Vec<_>>(),
        vec![(15, true), (15, false)]
    );

    Ok(())
}

#[test_context(SensorContext)]
#[tokio::test]
async fn test_laser_axis_replaces_camera_height(ctx: &mut SensorContext) -> TestResult {
    let sensors = DistanceSensors::new(LaserConfig {
        host: "127.0.0.1".to_string(),
        port: ctx.gateway.port,
        instance: 101,
        offsets: vec![118, 120],
        poll_ms: 50,
        timeout_ms: 500,
    });
    sensors.start();
    assert!(common::eventually(Duration::from_secs(3), || sensors.reading(0).is_some()).await);

    let axes = AxisSources {
        z: AxisSource::Laser {
            sensor: 1,
            offset_mm: 300.0,
        },
        ..Default::default()
    };
    let scanner = scanner(vec![ctx.board.target(1, 3, Some(1))], axes, Some(sensors.clone()), 150);
    scanner.start();

    let outcome = scanner.trigger().await?;
    assert_eq!(outcome.dimensions, Dimensions::new(60.0, 60.0, 50.0));

    sensors.stop().await;
    Ok(())
}
