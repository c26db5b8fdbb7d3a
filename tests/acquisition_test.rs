//! End-to-end acquisition tests against a scripted stub sensor.
//!
//! The stub accepts the server's TCP session, reads each poll command and
//! either replies with a canned telegram or hangs up, so the tests can walk
//! the loop through obstruction, transient errors and sustained failure
//! while observing what a realtime subscriber actually receives.

use sickradar_server::config::{RadarConfig, StoreConfig};
use sickradar_server::hub::Hub;
use sickradar_server::models::{RadarStatus, ServerMessage, StatusKind};
use sickradar_server::radar::RadarService;
use sickradar_server::state::new_state;
use sickradar_server::store::StoreService;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const HEALTHY_TELEGRAM: &[u8] =
    b"\x02sRA LMDradardata 1 P3DX1 3A83126F 0 7 0000 01F4 03E8 05DC 07D0 09C4 0BB8 \
      V3DX1 3C23D70A 0 7 0000 FFF6 000A 0000 0014 FFEC 0000\x03";

const OBSTRUCTED_TELEGRAM: &[u8] =
    b"\x02sRA LMDradardata 1 P3DX1 3A83126F 0 7 0000 0000 0000 0000 0000 0000 0000 \
      V3DX1 3C23D70A 0 7 0000 0000 0000 0000 0000 0000 0000\x03";

#[derive(Clone, Copy)]
enum StubAction {
    Reply(&'static [u8]),
    Hangup,
}

/// Serves the scripted actions, then keeps answering with the healthy
/// telegram.
fn spawn_stub_sensor(listener: TcpListener, script: Vec<StubAction>) {
    tokio::spawn(async move {
        let mut script = script.into_iter();
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            loop {
                let mut buf = [0u8; 256];
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                match script.next().unwrap_or(StubAction::Reply(HEALTHY_TELEGRAM)) {
                    StubAction::Reply(telegram) => {
                        if socket.write_all(telegram).await.is_err() {
                            break;
                        }
                    }
                    StubAction::Hangup => break,
                }
            }
        }
    });
}

struct Rig {
    hub: Hub,
    subscriber: mpsc::Receiver<ServerMessage>,
    shutdown: watch::Sender<bool>,
    radar_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

/// Stands the pipeline up against the stub with a fast tick and a
/// pre-admitted subscriber.
async fn start_rig(script: Vec<StubAction>, max_consecutive_errors: u32) -> Rig {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    spawn_stub_sensor(listener, script);

    let radar_config = RadarConfig {
        host: "127.0.0.1".into(),
        port,
        sample_rate_ms: 10,
        max_consecutive_errors,
        reconnect_delay_ms: 20,
        ..RadarConfig::default()
    };

    let store = StoreService::connect(StoreConfig {
        enabled: false,
        ..StoreConfig::default()
    })
    .await;

    let status = new_state(RadarStatus::initializing());
    let last_frame = new_state(None);
    let last_update = new_state(None);
    let hub = Hub::new(512, status.clone(), last_frame.clone(), store.clone());
    let (_id, subscriber) = hub.admit("127.0.0.1:9", "test-subscriber");

    let (shutdown, shutdown_rx) = watch::channel(false);
    let (writer, writer_handle) = store.spawn_writer(shutdown.subscribe());

    let service = RadarService::new(
        radar_config,
        hub.clone(),
        writer,
        status,
        last_frame,
        last_update,
    );
    let radar_handle = service.spawn(shutdown_rx);

    Rig {
        hub,
        subscriber,
        shutdown,
        radar_handle,
        writer_handle,
    }
}

/// Drains subscriber messages for `window`, returning the status updates in
/// arrival order as (tag, errorCount).
async fn collect_statuses(
    rx: &mut mpsc::Receiver<ServerMessage>,
    window: Duration,
) -> Vec<(StatusKind, Option<u32>)> {
    let deadline = tokio::time::Instant::now() + window;
    let mut statuses = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, rx.recv()).await {
            Ok(Some(ServerMessage::Status { status, error_count, .. })) => {
                statuses.push((status, error_count));
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    statuses
}

#[tokio::test]
async fn obstruction_flips_the_status_and_back() {
    let mut rig = start_rig(
        vec![
            StubAction::Reply(OBSTRUCTED_TELEGRAM),
            StubAction::Reply(HEALTHY_TELEGRAM),
        ],
        5,
    )
    .await;

    let statuses = collect_statuses(&mut rig.subscriber, Duration::from_millis(300)).await;
    let tags: Vec<StatusKind> = statuses.iter().map(|(tag, _)| *tag).collect();

    // admission snapshot, then the obstruction, then exactly one flip back
    assert_eq!(
        tags,
        vec![StatusKind::Initializing, StatusKind::Obstructed, StatusKind::Ok],
        "unexpected status sequence: {statuses:?}"
    );

    let _ = rig.shutdown.send(true);
    let _ = rig.radar_handle.await;
}

#[tokio::test]
async fn transient_errors_below_the_threshold_stay_silent() {
    let mut rig = start_rig(vec![StubAction::Hangup, StubAction::Hangup], 5).await;

    let statuses = collect_statuses(&mut rig.subscriber, Duration::from_millis(300)).await;
    let tags: Vec<StatusKind> = statuses.iter().map(|(tag, _)| *tag).collect();

    assert!(
        !tags.contains(&StatusKind::CommFailure),
        "two failures with threshold 5 must not publish comm_failure: {statuses:?}"
    );
    let ok_count = tags.iter().filter(|&&tag| tag == StatusKind::Ok).count();
    assert_eq!(ok_count, 1, "recovery must publish ok exactly once: {statuses:?}");

    let _ = rig.shutdown.send(true);
    let _ = rig.radar_handle.await;
}

#[tokio::test]
async fn sustained_failure_reports_comm_failure_with_the_error_count() {
    let mut rig = start_rig(vec![StubAction::Hangup; 6], 5).await;

    let statuses = collect_statuses(&mut rig.subscriber, Duration::from_millis(500)).await;

    let failure = statuses
        .iter()
        .find(|(tag, _)| *tag == StatusKind::CommFailure)
        .expect("six failures with threshold 5 must publish comm_failure");
    assert_eq!(failure.1, Some(6), "errorCount must reflect the sixth failure");

    // nothing below the threshold leaked out
    assert!(statuses
        .iter()
        .filter(|(tag, _)| *tag == StatusKind::CommFailure)
        .all(|(_, count)| count.unwrap_or(0) >= 6));

    // the loop keeps polling and recovers once the sensor answers again
    assert!(
        statuses.iter().any(|(tag, _)| *tag == StatusKind::Ok),
        "expected recovery after the stub turns healthy: {statuses:?}"
    );

    let _ = rig.shutdown.send(true);
    let _ = rig.radar_handle.await;
}

#[tokio::test]
async fn subscribers_receive_decoded_metric_frames() {
    let mut rig = start_rig(Vec::new(), 5).await;
    let scale_v = f32::from_bits(0x3C23D70A) as f64;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    let mut seen_metrics = None;
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(100), rig.subscriber.recv()).await {
            Ok(Some(ServerMessage::Metrics { velocities, status, .. })) => {
                seen_metrics = Some((velocities, status));
                break;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    let (velocities, status) = seen_metrics.expect("no metrics broadcast received");
    assert_eq!(status, StatusKind::Ok);
    assert!((velocities[1] - (-10.0 * scale_v)).abs() < 1e-9);
    assert!((velocities[4] - (20.0 * scale_v)).abs() < 1e-9);

    let _ = rig.shutdown.send(true);
    let _ = rig.radar_handle.await;
}

#[tokio::test]
async fn shutdown_stops_every_task_within_the_grace_period() {
    let mut rig = start_rig(Vec::new(), 5).await;

    // wait for at least one frame so the loop is demonstrably live
    let _ = timeout(Duration::from_millis(500), rig.subscriber.recv()).await;

    let _ = rig.shutdown.send(true);
    timeout(Duration::from_secs(2), rig.radar_handle)
        .await
        .expect("acquisition loop must stop within the grace period")
        .unwrap();
    timeout(Duration::from_secs(2), rig.writer_handle)
        .await
        .expect("persistence worker must stop within the grace period")
        .unwrap();

    rig.hub.shutdown();
    // queue closed: the subscriber transport would now tear down
    while let Ok(Some(_)) = timeout(Duration::from_millis(100), rig.subscriber.recv()).await {}
    assert_eq!(rig.hub.client_count(), 0);
}
