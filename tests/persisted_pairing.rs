mod common;

use std::sync::Arc;

use common::*;
use meshlink::link::LinkStatus;
use meshlink::protocol::RegionCode;
use meshlink::region::RegionApplyStatus;
use meshlink::storage::{JsonFileStore, PairingStore, PersistedLink};
use tokio_test::assert_ok;

#[tokio::test]
async fn pairing_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("data/link_state.json");

    {
        let (radio, link) = rig_with_store(fast_settings(), Arc::new(JsonFileStore::new(&path)));
        radio.set_reboot_on_region(None);
        let fresh = assert_ok!(link.start().await);
        assert_eq!(fresh, PersistedLink::default());
        assert_ok!(link.connect_manual(radio_a()).await);
        assert_eq!(
            link.apply_region(RegionCode::Eu868).await,
            Ok(RegionApplyStatus::Applied)
        );
        assert_ok!(link.set_auto_reconnect(false).await);
        link.shutdown().await;
    }

    let store = JsonFileStore::new(&path);
    let saved = assert_ok!(store.load().await);
    assert_eq!(saved.target, Some(radio_a()));
    assert!(!saved.auto_reconnect);
    assert!(saved.region_configured);
    assert_eq!(saved.region, Some(RegionCode::Eu868));

    let (_radio, link) = rig_with_store(fast_settings(), Arc::new(store));
    let restored = assert_ok!(link.start().await);
    assert_eq!(restored, saved);
    assert_eq!(link.pairing().device(), Some(radio_a().id));
    assert_eq!(link.status(), LinkStatus::Disconnected);
    link.shutdown().await;
}

#[tokio::test]
async fn first_run_seeds_auto_reconnect_from_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state.json");
    let mut settings = fast_settings();
    settings.auto_reconnect_default = false;

    let (_radio, link) = rig_with_store(settings, Arc::new(JsonFileStore::new(&path)));
    let seeded = assert_ok!(link.start().await);
    assert!(!seeded.auto_reconnect);
    assert!(!assert_ok!(JsonFileStore::new(&path).load().await).auto_reconnect);
    link.shutdown().await;
}

#[tokio::test]
async fn switching_radios_clears_region_flag() {
    let rig = connected_rig(fast_settings()).await;
    rig.radio.set_reboot_on_region(None);
    rig.radio.add_device(&radio_b());
    assert_eq!(
        rig.link.apply_region(RegionCode::Us).await,
        Ok(RegionApplyStatus::Applied)
    );
    assert!(assert_ok!(rig.store.load().await).region_configured);

    assert_ok!(rig.link.connect_manual(radio_b()).await);
    let saved = assert_ok!(rig.store.load().await);
    assert_eq!(saved.target, Some(radio_b()));
    assert!(!saved.region_configured);
    assert_eq!(saved.region, None);
    assert_eq!(rig.link.region().status(), RegionApplyStatus::Idle);
}

#[tokio::test]
async fn forget_device_clears_everything() {
    let rig = connected_rig(fast_settings()).await;
    assert_ok!(rig.link.forget_device().await);

    let saved = assert_ok!(rig.store.load().await);
    assert_eq!(saved.target, None);
    assert!(!saved.region_configured);
    assert_eq!(rig.link.pairing().device(), None);
    assert_eq!(rig.link.status(), LinkStatus::Disconnected);
    assert!(rig.link.current_session().is_none());
}
