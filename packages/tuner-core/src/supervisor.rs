//! Supervisor (§4.E): spawns the capture/detection child process with
//! best-effort elevated scheduling priority, restarts it on exit, and
//! orchestrates the parent's shutdown ordering.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{TunerError, TunerResult};
use crate::events::{EventEmitter, SupervisorEvent};
use crate::utils::now_millis;

const CRASH_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Child lifecycle from the supervisor's perspective (§4.E). `Shutdown` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    NotStarted,
    Running,
    Restarting,
    CrashedBackoff,
    Shutdown,
}

/// Spawns and restarts a single child process (§4.E).
pub struct Supervisor {
    program: OsString,
    args: Vec<OsString>,
    restart_exit_code: i32,
    emitter: Arc<dyn EventEmitter>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        program: impl Into<OsString>,
        args: Vec<OsString>,
        restart_exit_code: i32,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            restart_exit_code,
            emitter,
        }
    }

    /// Runs the spawn/respawn loop until `cancel` fires, at which point the
    /// running child (if any) is asked to terminate and the call returns.
    pub async fn run(&self, cancel: CancellationToken) -> TunerResult<()> {
        let mut state = ChildState::NotStarted;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut child = self.spawn_child()?;
            state = ChildState::Running;

            let wait = tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Ok(());
                }
                status = child.wait() => status,
            };

            let status = wait.map_err(|e| TunerError::Fatal(format!("child wait failed: {e}")))?;
            let code = status.code();
            let restart = code == Some(self.restart_exit_code);

            self.emitter.emit(
                SupervisorEvent::ChildExited {
                    code,
                    restart,
                    timestamp: now_millis(),
                }
                .into(),
            );

            if restart {
                state = ChildState::Restarting;
            } else {
                state = ChildState::CrashedBackoff;
                tokio::time::sleep(CRASH_BACKOFF).await;
            }
            debug_assert!(matches!(state, ChildState::Restarting | ChildState::CrashedBackoff));
        }
    }

    fn spawn_child(&self) -> TunerResult<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        let mut child = command
            .spawn()
            .map_err(|e| TunerError::Fatal(format!("failed to spawn capture child: {e}")))?;

        if let Some(pid) = child.id() {
            raise_priority(pid);
            self.emitter.emit(
                SupervisorEvent::ChildSpawned {
                    pid,
                    timestamp: now_millis(),
                }
                .into(),
            );
        }

        Ok(child)
    }

    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            send_terminate(pid);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn raise_priority(pid: u32) {
    // Best-effort: the OS may deny this for an unprivileged process, which
    // is not an error condition (§4.E "proceed silently").
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, -10) };
    if rc != 0 {
        tracing::debug!(pid, "could not raise capture child scheduling priority");
    }
}

#[cfg(windows)]
fn raise_priority(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, SetPriorityClass, HIGH_PRIORITY_CLASS, PROCESS_SET_INFORMATION,
    };
    unsafe {
        let handle = OpenProcess(PROCESS_SET_INFORMATION, 0, pid);
        if handle == 0 {
            tracing::debug!(pid, "could not open capture child to raise priority");
            return;
        }
        if SetPriorityClass(handle, HIGH_PRIORITY_CLASS) == 0 {
            tracing::debug!(pid, "could not raise capture child scheduling priority");
        }
        CloseHandle(handle);
    }
}

#[cfg(not(any(unix, windows)))]
fn raise_priority(_pid: u32) {}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(windows)]
fn send_terminate(_pid: u32) {
    // Windows has no SIGTERM equivalent cooperative signal reachable without
    // the child's own message loop; the grace-period timeout falls through
    // to `start_kill` below.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    #[tokio::test]
    async fn respawns_immediately_on_restart_exit_code() {
        let supervisor = Supervisor::new(
            "sh",
            vec!["-c".into(), "exit 75".into()],
            75,
            Arc::new(NoopEventEmitter),
        );
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel_clone.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run(cancel)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unknown_program_surfaces_as_fatal_error() {
        let supervisor = Supervisor::new(
            "definitely-not-a-real-binary-xyz",
            vec![],
            75,
            Arc::new(NoopEventEmitter),
        );
        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunerError::Fatal(_)));
    }
}
