#![cfg(unix)]

use plf_syncd::shutdown_signal;
use std::process::Command;
use std::time::Duration;

#[tokio::test]
async fn test_sigterm_resolves_shutdown_signal() {
    let signal = shutdown_signal().unwrap();

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let received = tokio::time::timeout(Duration::from_secs(5), signal)
        .await
        .expect("SIGTERM was not observed");
    assert_eq!(received, "SIGTERM");
}
