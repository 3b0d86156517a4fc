use sha2::Digest as _;
use wemixvisor::{
    process::ProcessState,
    upgrade::UpgradeInfo,
};
use wiremock::{
    matchers::{
        method,
        path,
    },
    Mock,
    MockServer,
    ResponseTemplate,
};

use crate::helpers::{
    TestSupervisor,
    NODE,
};

/// Scenario: the binary for `v3@2000` downloads but fails checksum
/// verification. The data directory is rolled back to the pre-attempt
/// snapshot, the node keeps running on the previous binary, and the armed
/// upgrade stays set for operator action.
#[tokio::test]
async fn checksum_mismatch_rolls_back_and_keeps_armed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v3/{NODE}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"the served binary".as_slice()))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v3/{NODE}.sha256")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    // The published checksum belongs to different bytes.
    Mock::given(method("GET"))
        .and(path(format!("/v3/{NODE}.sha256")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(hex::encode(sha2::Sha256::digest(b"different bytes"))),
        )
        .mount(&server)
        .await;

    let url = format!("{}/v3/{NODE}", server.uri());
    let mut test = TestSupervisor::spawn(1900, move |cfg| {
        cfg.allow_download_binaries = true;
        cfg.download_urls = format!(r#"{{"v3": "{url}"}}"#);
    })
    .await;
    std::fs::write(test.home.path().join("data").join("state"), b"pre-upgrade state").unwrap();

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;
    test.handle
        .scheduler()
        .schedule(UpgradeInfo::new("v3", 2000))
        .unwrap();
    test.await_status(|status| status.armed.is_some()).await;

    test.provider.set_height(2000);

    // The attempt leaves a backup behind, so its appearance marks that the
    // critical section ran.
    test.await_condition(|test| {
        test.backups_dir()
            .read_dir()
            .map(|entries| entries.count() > 0)
            .unwrap_or(false)
    })
    .await;
    test.await_condition(|test| {
        let status = test.handle.status();
        !status.upgrading && test.handle.process_status().state == ProcessState::Running
    })
    .await;

    let status = test.handle.status();
    assert_eq!(status.armed, Some(UpgradeInfo::new("v3", 2000)));
    assert_eq!(status.last_applied_height, 0);

    // Still on the previous binary, with the pre-attempt data intact.
    assert_eq!(test.current_pointer(), std::path::PathBuf::from("genesis"));
    assert_eq!(
        std::fs::read(test.home.path().join("data").join("state")).unwrap(),
        b"pre-upgrade state",
    );
    assert!(!test.upgrade_bin_path("v3").exists());

    test.shutdown().await;
}
