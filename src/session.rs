use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Identifies the running process, so that a [`crate::metadata::DownloadMarker`]
/// left behind by a crash can be told apart from one that belongs to the
/// live process (spec §3, §4.2, §9).
pub type SessionId = u64;

static PROCESS_SESSION: Lazy<SessionId> = Lazy::new(generate_session_id);

/// The session id for the currently running process. Stable for the
/// lifetime of the process, freshly generated on every start.
pub fn current() -> SessionId {
    *PROCESS_SESSION
}

fn generate_session_id() -> SessionId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    nanos ^ (pid.rotate_left(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_within_process() {
        assert_eq!(current(), current());
    }
}
