use std::time::Duration;

use wemixvisor::upgrade::{
    InvalidUpgrade,
    UpgradeInfo,
    UpgradePlan,
};

use crate::helpers::{
    place_executable,
    TestSupervisor,
    LONG_RUNNING_NODE,
};

/// Ten concurrent schedules of the same upgrade arm it once and apply it
/// once.
#[tokio::test]
async fn duplicate_schedules_apply_once() {
    let mut test = TestSupervisor::spawn(2900, |_| {}).await;
    place_executable(&test.upgrade_bin_path("v4"), LONG_RUNNING_NODE);

    let mut schedules = Vec::new();
    for _ in 0..10 {
        let scheduler = test.handle.scheduler();
        schedules.push(tokio::spawn(async move {
            scheduler.schedule(UpgradeInfo::new("v4", 3000))
        }));
    }
    for schedule in schedules {
        schedule.await.unwrap().unwrap();
    }

    let status = test
        .await_status(|status| status.armed == Some(UpgradeInfo::new("v4", 3000)))
        .await;
    assert!(!status.upgrading);

    test.provider.set_height(3000);
    test.await_status(|status| status.last_applied_height == 3000)
        .await;

    // Exactly one critical section ran, observable as exactly one backup.
    let backups = std::fs::read_dir(test.backups_dir())
        .unwrap()
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("pre-upgrade-v4")
        })
        .count();
    assert_eq!(backups, 1);

    test.shutdown().await;
}

/// A schedule whose target height the chain has already passed is rejected
/// and arms nothing.
#[tokio::test]
async fn passed_height_is_rejected() {
    let mut test = TestSupervisor::spawn(5000, |_| {}).await;

    test.await_condition(|test| test.handle.current_height() == 5000)
        .await;

    let error = test
        .handle
        .scheduler()
        .schedule(UpgradeInfo::new("v5", 4000))
        .unwrap_err();
    assert!(matches!(error, InvalidUpgrade::HeightExceeded { .. }));
    assert!(error.to_string().contains("height exceeded"), "{error}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(test.handle.status().armed, None);

    test.shutdown().await;
}

/// Invalid JSON in the watched file is logged and skipped; a later valid
/// write still arms.
#[tokio::test]
async fn invalid_watched_file_is_skipped() {
    let mut test = TestSupervisor::spawn(100, |_| {}).await;
    place_executable(&test.upgrade_bin_path("v2"), LONG_RUNNING_NODE);

    std::fs::write(test.upgrade_info_path(), "{ definitely not json").unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(test.handle.status().armed, None);

    std::fs::write(
        test.upgrade_info_path(),
        r#"{"name": "v2", "height": 200}"#,
    )
    .unwrap();
    test.await_status(|status| status.armed == Some(UpgradeInfo::new("v2", 200)))
        .await;

    test.shutdown().await;
}

/// Executing a plan persists it, writes per-height upgrade-info copies, and
/// schedules the next applicable upgrade.
#[tokio::test]
async fn plan_execution_schedules_next_upgrade() {
    let mut test = TestSupervisor::spawn(150, |_| {}).await;
    test.await_condition(|test| test.handle.current_height() == 150)
        .await;

    let plan = UpgradePlan {
        version: "1.0".to_string(),
        name: "rollout".to_string(),
        description: "two-step rollout".to_string(),
        created_at: chrono::Utc::now(),
        upgrades: vec![UpgradeInfo::new("v2", 100), UpgradeInfo::new("v3", 300)],
    };
    let plans_dir = test.home.path().join("wemixvisor").join("plans");
    let data_dir = test.home.path().join("data");
    plan.execute(&test.handle.scheduler(), &plans_dir, &data_dir)
        .await
        .unwrap();

    // v2@100 already lies behind the chain; v3@300 is the next applicable.
    test.await_status(|status| status.armed == Some(UpgradeInfo::new("v3", 300)))
        .await;
    assert_eq!(std::fs::read_dir(&plans_dir).unwrap().count(), 1);
    for height in ["100", "300"] {
        assert!(data_dir
            .join("upgrades")
            .join(height)
            .join("upgrade-info.json")
            .exists());
    }

    test.shutdown().await;
}

/// A zero or empty-name upgrade in the watched file never arms.
#[tokio::test]
async fn invalid_upgrade_fields_never_arm() {
    let mut test = TestSupervisor::spawn(100, |_| {}).await;

    std::fs::write(test.upgrade_info_path(), r#"{"name": "", "height": 200}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(test.handle.status().armed, None);

    std::fs::write(test.upgrade_info_path(), r#"{"name": "v2", "height": 0}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(test.handle.status().armed, None);

    test.shutdown().await;
}
