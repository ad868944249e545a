mod common;

use std::time::Duration;

use common::*;
use meshlink::link::{LinkNotice, LinkStatus};
use meshlink::reconnect::{wait_for_state, AbortReason, ReconnectEvent};
use meshlink::session::ConnectionSessionState;

#[tokio::test]
async fn manual_connect_preempts_running_loop() {
    let mut settings = fast_settings();
    // Long scan window so the loop is parked in a scan when the user acts.
    settings.reconnect.scan_timeout = Duration::from_secs(2);
    let poll = settings.reconnect.poll_interval;
    let rig = connected_rig(settings).await;
    let mut loop_events = rig.link.reconnect().subscribe();
    let mut notices = rig.link.subscribe_notices();

    rig.radio.set_discoverable(&radio_a().id, false);
    rig.radio.drop_link();

    let mut guard_rx = rig.link.guard().subscribe();
    tokio::time::timeout(
        Duration::from_millis(500),
        wait_for_state(&mut guard_rx, ConnectionSessionState::Scanning),
    )
    .await
    .expect("loop claimed the guard");
    assert!(eventually(Duration::from_millis(500), || rig.radio.counters().scans == 1).await);

    rig.radio.set_discoverable(&radio_a().id, true);
    let session = rig
        .link
        .connect_manual(radio_a())
        .await
        .expect("manual connect wins");

    let aborted = tokio::time::timeout(poll * 20, async {
        loop {
            match loop_events.recv().await {
                Ok(ReconnectEvent::Aborted(reason)) => return Some(reason),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .expect("loop stood down promptly");
    assert!(matches!(
        aborted,
        Some(AbortReason::ManualConnect) | Some(AbortReason::Cancelled)
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let counters = rig.radio.counters();
    // Initial connect plus the manual one; the loop never touched the transport.
    assert_eq!(counters.connects, 2);
    assert_eq!(counters.scans, 1);
    assert_eq!(rig.link.guard().state(), ConnectionSessionState::Idle);
    assert_eq!(rig.link.status(), LinkStatus::Ready);
    assert_eq!(rig.link.current_session(), Some(session));
    assert!(!drain(&mut notices)
        .iter()
        .any(|n| matches!(n, LinkNotice::Recovered { .. } | LinkNotice::ReconnectFailed { .. })));
}

#[tokio::test]
async fn manual_connect_during_settle_delay_wins() {
    let mut settings = fast_settings();
    settings.reconnect.settle_delay = Duration::from_secs(1);
    let rig = connected_rig(settings).await;
    let mut loop_events = rig.link.reconnect().subscribe();

    rig.radio.drop_link();
    assert!(eventually(Duration::from_millis(500), || rig.link.reconnect().is_running()).await);

    rig.link
        .connect_manual(radio_a())
        .await
        .expect("manual connect");

    let event = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match loop_events.recv().await {
                Ok(ReconnectEvent::Aborted(reason)) => return Some(reason),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .expect("aborted event");
    assert!(event.is_some());
    assert_eq!(rig.radio.counters().scans, 0);
    assert_eq!(rig.radio.counters().connects, 2);
    assert!(!rig.link.reconnect().is_running());
}

#[tokio::test]
async fn user_disconnect_cancels_running_loop() {
    let mut settings = fast_settings();
    settings.reconnect.scan_timeout = Duration::from_secs(2);
    let rig = connected_rig(settings).await;
    let mut loop_events = rig.link.reconnect().subscribe();

    rig.radio.set_discoverable(&radio_a().id, false);
    rig.radio.drop_link();
    assert!(eventually(Duration::from_millis(500), || rig.radio.counters().scans == 1).await);

    rig.link.disconnect().await.expect("disconnect");

    let reason = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match loop_events.recv().await {
                Ok(ReconnectEvent::Aborted(reason)) => return Some(reason),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .expect("aborted event");
    assert!(matches!(
        reason,
        Some(AbortReason::UserDisconnected) | Some(AbortReason::Cancelled)
    ));
    assert_eq!(rig.link.guard().state(), ConnectionSessionState::Idle);
    assert_eq!(rig.link.status(), LinkStatus::Disconnected);
}
