mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use meshlink::error::RegionError;
use meshlink::link::{LinkNotice, LinkStatus};
use meshlink::protocol::RegionCode;
use meshlink::region::RegionApplyStatus;
use meshlink::storage::PairingStore;
use meshlink::transport::{LinkEvent, LinkState, TransportLink};

fn disconnects(events: &[LinkEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                LinkEvent::StateChanged {
                    state: LinkState::Disconnected,
                    ..
                }
            )
        })
        .count()
}

#[tokio::test]
async fn reboot_cycle_confirms_region() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(Some(Duration::from_millis(50)));
    let mut link_events = rig.radio.subscribe();
    let mut notices = rig.link.subscribe_notices();

    let status = tokio::time::timeout(
        Duration::from_secs(3),
        rig.link.apply_region(RegionCode::Eu868),
    )
    .await
    .expect("apply finished");
    assert_eq!(status, Ok(RegionApplyStatus::Applied));
    assert_eq!(rig.radio.region(), RegionCode::Eu868);

    let seen = drain(&mut link_events);
    assert_eq!(disconnects(&seen), 1, "events: {:?}", seen);

    let persisted = rig.store.load().await.expect("load");
    assert!(persisted.region_configured);
    assert_eq!(persisted.region, Some(RegionCode::Eu868));

    let recovered = wait_for_notice(&mut notices, Duration::from_secs(1), |n| {
        matches!(n, LinkNotice::Recovered { .. })
    })
    .await;
    assert!(recovered.is_some());
    let seen = drain(&mut notices);
    assert!(
        !seen.iter().any(|n| matches!(n, LinkNotice::ConnectionLost { .. })),
        "expected reboot reported as a loss: {:?}",
        seen
    );
    assert_eq!(rig.link.status(), LinkStatus::Ready);
    assert_eq!(rig.link.region().status(), RegionApplyStatus::Applied);
}

#[tokio::test]
async fn failed_handshake_after_reboot_is_retried() {
    let mut settings = fast_settings();
    settings.reconnect.max_attempts = 5;
    let rig = connected_rig(settings).await;
    rig.radio.set_reboot_on_region(Some(Duration::from_millis(30)));
    rig.radio.fail_next_handshakes(1);
    let mut link_events = rig.radio.subscribe();

    let status = tokio::time::timeout(
        Duration::from_secs(3),
        rig.link.apply_region(RegionCode::Eu868),
    )
    .await
    .expect("apply finished");
    assert_eq!(status, Ok(RegionApplyStatus::Applied));

    // Reboot drop plus the drop after the failed handshake.
    let seen = drain(&mut link_events);
    assert_eq!(disconnects(&seen), 2, "events: {:?}", seen);

    let persisted = rig.store.load().await.expect("load");
    assert!(persisted.region_configured);
    assert_eq!(persisted.region, Some(RegionCode::Eu868));
    assert_eq!(rig.link.region().status(), RegionApplyStatus::Applied);
}

#[tokio::test]
async fn reapplying_the_same_region_writes_once() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(Some(Duration::from_millis(20)));

    let first = rig.link.apply_region(RegionCode::Us).await;
    assert_eq!(first, Ok(RegionApplyStatus::Applied));
    let second = rig.link.apply_region(RegionCode::Us).await;
    assert_eq!(second, Ok(RegionApplyStatus::Applied));
    assert_eq!(rig.radio.counters().region_writes, 1);
}

#[tokio::test]
async fn in_place_apply_without_reboot() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(None);
    let mut notices = rig.link.subscribe_notices();

    let status = rig.link.apply_region(RegionCode::Jp).await;
    assert_eq!(status, Ok(RegionApplyStatus::Applied));
    assert_eq!(
        wait_for_notice(&mut notices, Duration::from_millis(100), |n| matches!(
            n,
            LinkNotice::RegionApplied { .. }
        ))
        .await,
        Some(LinkNotice::RegionApplied {
            region: RegionCode::Jp
        })
    );
    assert_eq!(rig.radio.counters().connects, 1);
}

#[tokio::test]
async fn reboot_is_followed_even_with_auto_reconnect_off() {
    let rig = connected_rig(fast_settings()).await;
    rig.link.set_auto_reconnect(false).await.expect("flag");
    rig.radio.set_reboot_on_region(Some(Duration::from_millis(30)));

    let status = tokio::time::timeout(
        Duration::from_secs(3),
        rig.link.apply_region(RegionCode::Anz),
    )
    .await
    .expect("apply finished");
    assert_eq!(status, Ok(RegionApplyStatus::Applied));
    assert!(rig.radio.counters().connects >= 2);
}

#[tokio::test]
async fn reconnect_to_other_radio_is_a_mismatch() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.add_device(&radio_b());
    rig.radio.set_reboot_on_region(Some(Duration::from_secs(5)));
    let link = Arc::new(rig.link);
    let mut notices = link.subscribe_notices();

    let applying = {
        let link = link.clone();
        tokio::spawn(async move { link.apply_region(RegionCode::Eu868).await })
    };
    let radio = rig.radio.clone();
    assert!(
        eventually(Duration::from_millis(500), || radio.state() == LinkState::Disconnected).await,
        "radio never went down for the reboot"
    );
    assert!(link.region().expecting_reboot());

    link.connect_manual(radio_b()).await.expect("connect to B");

    let result = tokio::time::timeout(Duration::from_secs(1), applying)
        .await
        .expect("apply finished")
        .expect("task joined");
    assert_eq!(
        result,
        Err(RegionError::DeviceMismatch {
            expected: radio_a().id.to_string(),
            found: radio_b().id.to_string(),
        })
    );
    assert_eq!(link.region().status(), RegionApplyStatus::Failed);
    let failed = wait_for_notice(&mut notices, Duration::from_millis(200), |n| {
        matches!(n, LinkNotice::RegionFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        Some(LinkNotice::RegionFailed {
            region: RegionCode::Eu868,
            ..
        })
    ));
    let persisted = rig.store.load().await.expect("load");
    assert!(!persisted.region_configured);
    assert_eq!(persisted.target, Some(radio_b()));
}

#[tokio::test]
async fn different_value_while_applying_is_busy() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(Some(Duration::from_secs(5)));
    let link = Arc::new(rig.link);

    let _applying = {
        let link = link.clone();
        tokio::spawn(async move { link.apply_region(RegionCode::Eu868).await })
    };
    assert!(eventually(Duration::from_millis(500), || link.region().expecting_reboot()).await);

    assert_eq!(
        link.apply_region(RegionCode::Us).await,
        Err(RegionError::Busy("EU_868".into()))
    );
    assert_eq!(
        link.apply_region(RegionCode::Eu868).await,
        Ok(RegionApplyStatus::Applying)
    );
    assert_eq!(rig.radio.counters().region_writes, 1);
}

#[tokio::test]
async fn apply_without_session_is_rejected() {
    let rig = started_rig(fast_settings()).await;
    assert_eq!(
        rig.link.apply_region(RegionCode::Eu868).await,
        Err(RegionError::NotConnected)
    );
    assert_eq!(rig.link.region().status(), RegionApplyStatus::Idle);
    assert_eq!(rig.radio.counters().region_writes, 0);
}

#[tokio::test]
async fn silent_radio_times_out() {
    let mut settings = fast_settings();
    settings.region.confirm_timeout = Duration::from_millis(150);
    let rig = connected_rig(settings).await;
    rig.radio.set_reboot_on_region(None);
    rig.radio.set_region_reports(false);

    let result = rig.link.apply_region(RegionCode::In).await;
    assert_eq!(
        result,
        Err(RegionError::Timeout(Duration::from_millis(150)))
    );
    assert_eq!(
        result.unwrap_err().to_string(),
        "no confirmation within 150ms"
    );
    assert_eq!(rig.link.region().status(), RegionApplyStatus::Failed);
    assert!(!rig.store.load().await.expect("load").region_configured);
}

#[tokio::test]
async fn exhausted_recovery_fails_the_apply_as_link_lost() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(Some(Duration::from_secs(10)));
    let mut notices = rig.link.subscribe_notices();

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        rig.link.apply_region(RegionCode::Eu868),
    )
    .await
    .expect("apply finished");
    assert_eq!(result, Err(RegionError::LinkLost));
    // Ends with the recovery loop, not at the confirmation deadline.
    assert!(started.elapsed() < Duration::from_secs(2));

    let failed = wait_for_notice(&mut notices, Duration::from_millis(200), |n| {
        matches!(n, LinkNotice::RegionFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        Some(LinkNotice::RegionFailed {
            region: RegionCode::Eu868,
            ..
        })
    ));
    assert!(!rig.store.load().await.expect("load").region_configured);
}
