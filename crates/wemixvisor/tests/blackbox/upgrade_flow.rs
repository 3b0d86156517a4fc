use std::time::Duration;

use wemixvisor::{
    process::ProcessState,
    upgrade::UpgradeInfo,
};

use crate::helpers::{
    place_executable,
    TestSupervisor,
    LONG_RUNNING_NODE,
};

/// Arms `v2@1500` at height 1000 and drives the chain through
/// 1000 → 1400 → 1500. The upgrade fires exactly at the target height.
#[tokio::test]
async fn upgrade_fires_at_exact_target_height() {
    let mut test = TestSupervisor::spawn(1000, |_| {}).await;
    place_executable(&test.upgrade_bin_path("v2"), LONG_RUNNING_NODE);

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;

    test.handle
        .scheduler()
        .schedule(UpgradeInfo::new("v2", 1500))
        .unwrap();
    test.await_status(|status| status.armed == Some(UpgradeInfo::new("v2", 1500)))
        .await;

    // Below the target nothing fires.
    test.provider.set_height(1400);
    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = test.handle.status();
    assert_eq!(status.last_applied_height, 0);
    assert!(status.armed.is_some());
    assert_eq!(test.current_pointer(), std::path::PathBuf::from("genesis"));

    // At the target the node stops, the pointer swaps, the node restarts.
    test.provider.set_height(1500);
    let status = test
        .await_status(|status| status.last_applied_height == 1500)
        .await;
    assert_eq!(status.armed, None);
    assert_eq!(status.last_applied_name.as_deref(), Some("v2"));

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;
    assert_eq!(
        test.current_pointer(),
        std::path::PathBuf::from("upgrades").join("v2"),
    );

    test.shutdown().await;
}

/// The watched `upgrade-info.json` file arms the orchestrator just like a
/// programmatic schedule does.
#[tokio::test]
async fn watched_file_arms_and_applies() {
    let mut test = TestSupervisor::spawn(100, |_| {}).await;
    place_executable(&test.upgrade_bin_path("v2"), LONG_RUNNING_NODE);

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;

    std::fs::write(
        test.upgrade_info_path(),
        r#"{"name": "v2", "height": 200}"#,
    )
    .unwrap();
    test.await_status(|status| status.armed == Some(UpgradeInfo::new("v2", 200)))
        .await;

    test.provider.set_height(200);
    let status = test
        .await_status(|status| status.last_applied_height == 200)
        .await;
    assert_eq!(status.last_applied_name.as_deref(), Some("v2"));

    test.shutdown().await;
}

/// An upgrade whose height was passed while it was being written to the
/// watched file is applied immediately on arming.
#[tokio::test]
async fn passed_height_from_file_applies_immediately() {
    let mut test = TestSupervisor::spawn(500, |_| {}).await;
    place_executable(&test.upgrade_bin_path("v2"), LONG_RUNNING_NODE);

    test.await_condition(|test| test.handle.current_height() == 500)
        .await;
    std::fs::write(
        test.upgrade_info_path(),
        r#"{"name": "v2", "height": 400}"#,
    )
    .unwrap();

    let status = test
        .await_status(|status| status.last_applied_height == 400)
        .await;
    assert_eq!(status.armed, None);

    test.shutdown().await;
}
