//! Helpers shared by unit tests that spawn real processes.

use std::time::{Duration, Instant};

/// Zombies awaiting a reaper count as gone.
pub(crate) fn is_running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Polls until the process recorded in `pid_file` exits, for at most two
/// seconds. Returns whether it is gone.
pub(crate) async fn exits_soon(pid_file: &std::path::Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    let pid = pid.trim();
    let deadline = Instant::now() + Duration::from_secs(2);
    while is_running(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !is_running(pid)
}
