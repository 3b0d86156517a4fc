use wemixvisor::process::ProcessState;

use crate::helpers::TestSupervisor;

/// A graceful shutdown stops the node and joins the orchestrator cleanly.
#[tokio::test]
async fn shutdown_stops_the_node() {
    let mut test = TestSupervisor::spawn(100, |_| {}).await;

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;
    let pid = test.handle.process_status().pid.unwrap();

    test.handle
        .shutdown()
        .await
        .expect("supervisor task must not panic")
        .expect("supervisor must shut down cleanly");

    // The node's process group is gone.
    let alive = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap()),
        None,
    );
    assert!(alive.is_err(), "node process {pid} survived shutdown");
}

/// The node being restarted after an unexpected exit is governed by config.
#[tokio::test]
async fn crashed_node_is_restarted() {
    let mut test = TestSupervisor::spawn(100, |_| {}).await;

    test.await_condition(|test| test.handle.process_status().state == ProcessState::Running)
        .await;
    let first_pid = test.handle.process_status().pid.unwrap();

    // Kill the node behind the supervisor's back.
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(first_pid).unwrap()),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    test.await_condition(|test| {
        let status = test.handle.process_status();
        status.state == ProcessState::Running && status.pid != Some(first_pid)
    })
    .await;
    assert!(test.handle.process_status().restart_count >= 1);

    test.shutdown().await;
}
