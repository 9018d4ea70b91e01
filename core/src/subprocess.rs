//! Launches colony worker processes: one per available CPU slot, each a
//! re-exec of the current binary rather than a `fork()`, since Rust has no
//! portable equivalent of forking a running async runtime safely.

use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{SwarmError, SwarmResult};

/// CPU-affinity cardinality of the current process, falling back to the
/// logical CPU count when affinity information isn't available (e.g.
/// inside some containers).
pub fn available_colony_slots() -> usize {
    core_affinity::get_core_ids().map(|ids| ids.len()).unwrap_or_else(num_cpus::get).max(1)
}

/// Tracks whether any child colonies are currently running, mirroring the
/// "manager holds a lock while any child is running" contract so callers
/// can poll `running()` without racing a spawn/reap.
#[derive(Clone)]
pub struct SubprocessManager {
    running: Arc<Mutex<Vec<Child>>>,
}

impl Default for SubprocessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessManager {
    pub fn new() -> Self {
        SubprocessManager { running: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn running(&self) -> bool {
        !self.running.lock().unwrap().is_empty()
    }

    /// Launches `slot_count` colony child processes, each re-invoking the
    /// current executable with `colony --bind-address <server_address>
    /// --hatchery-file <hatchery_file>`. The caller's binary is expected to
    /// dispatch that subcommand to [`crate::colony::Colony::run`].
    pub fn run_colonies(
        &self,
        server_address: &str,
        hatchery_file: &str,
        slot_count: usize,
    ) -> SwarmResult<()> {
        let current_exe = std::env::current_exe().map_err(SwarmError::Io)?;
        let mut guard = self.running.lock().unwrap();

        for _ in 0..slot_count {
            let child = Command::new(&current_exe)
                .arg("colony")
                .arg("--bind-address")
                .arg(server_address)
                .arg("--hatchery-file")
                .arg(hatchery_file)
                .spawn()
                .map_err(SwarmError::Io)?;
            info!(pid = child.id(), "spawned colony subprocess");
            guard.push(child);
        }

        Ok(())
    }

    /// Polls all children with a bounded timeout per round so cancellation
    /// stays responsive; returns once every child has exited.
    pub async fn wait_all(&self, poll_interval: Duration) {
        loop {
            let finished;
            {
                let mut guard = self.running.lock().unwrap();
                guard.retain_mut(|child| match child.try_wait() {
                    Ok(Some(_status)) => false,
                    Ok(None) => true,
                    Err(err) => {
                        warn!(error = %err, "failed to poll colony subprocess");
                        false
                    }
                });
                finished = guard.is_empty();
            }
            if finished {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
