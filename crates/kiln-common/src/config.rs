//! Runtime configuration resolved from the environment.
//!
//! - `KILN_FAKE`: short-circuit SSH and shrink every wait to test values
//! - `KILN_STATE_DIR`: root for the local store instead of the home directory

use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::Backoff;

/// Environment variable enabling fake execution
pub const FAKE_ENV: &str = "KILN_FAKE";
/// Environment variable overriding the local store root
pub const STATE_DIR_ENV: &str = "KILN_STATE_DIR";

/// Process-wide switches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Fake execution mode
    pub fake: bool,
    /// Custom local store root
    pub state_dir: Option<PathBuf>,
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl RuntimeConfig {
    /// Read `KILN_FAKE` and `KILN_STATE_DIR`
    pub fn from_env() -> Self {
        Self {
            fake: std::env::var(FAKE_ENV).map(|v| truthy(&v)).unwrap_or(false),
            state_dir: std::env::var(STATE_DIR_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Timings matching the execution mode
    pub fn timing(&self) -> Timing {
        if self.fake {
            Timing::fake()
        } else {
            Timing::default()
        }
    }
}

/// Every wait and retry budget used while provisioning and bootstrapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Pause before the first SSH dial so a fresh host can start sshd
    pub ssh_settle: Duration,
    /// TCP dial + handshake retries
    pub ssh_dial: Backoff,
    /// Session open / exit status retries for one script run
    pub ssh_session: Backoff,
    /// Lower bound of the random pause between retries of a script
    pub script_retry_pause: Duration,
    /// Polling an instance until it is active
    pub vm_watch: Backoff,
    /// Polling a network until it is active
    pub network_watch: Backoff,
    /// Retrying a network delete until dependants are gone
    pub network_delete: Backoff,
    /// Grace period after an instance delete
    pub vm_delete_grace: Duration,
    /// Pause between VM deletion and firewall deletion
    pub firewall_teardown: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ssh_settle: Duration::from_secs(20),
            ssh_dial: Backoff::new(Duration::from_secs(5), 2, 5),
            ssh_session: Backoff::new(Duration::from_secs(5), 1, 5),
            script_retry_pause: Duration::from_secs(1),
            vm_watch: Backoff::new(Duration::from_secs(10), 2, 6),
            network_watch: Backoff::new(Duration::from_secs(5), 2, 6),
            network_delete: Backoff::new(Duration::from_secs(5), 2, 6),
            vm_delete_grace: Duration::from_secs(2),
            firewall_teardown: Duration::from_secs(30),
        }
    }
}

impl Timing {
    /// Millisecond waits for tests and fake mode
    pub fn fake() -> Self {
        let ms = Duration::from_millis(1);
        Self {
            ssh_settle: Duration::ZERO,
            ssh_dial: Backoff::new(ms, 1, 3),
            ssh_session: Backoff::new(ms, 1, 3),
            script_retry_pause: ms,
            vm_watch: Backoff::new(ms, 1, 6),
            network_watch: Backoff::new(ms, 1, 6),
            network_delete: Backoff::new(ms, 1, 6),
            vm_delete_grace: Duration::ZERO,
            firewall_teardown: Duration::ZERO,
        }
    }
}
