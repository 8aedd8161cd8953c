//! Process handle and lifecycle.
//!
//! A [`Process`] is scoped to one compute system. Its exit watcher consumes
//! the exit notification and records the exit code; `wait` blocks on that
//! signal and `exit_code` reads it without blocking. Signals against a
//! process the host already considers gone are converted to a
//! successful-but-undelivered outcome, with a grace timer that force-unblocks
//! waiters if the real exit notification never lands.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::{Error, OpError, ProcessError, Result};
use crate::notify::{
    DispatchEngine, Notification, NotificationKind, NotifyStatus, Token, WaitError, WaitGate,
};
use crate::schema::{ProcessModifyRequest, ProcessStatus, StdioStream};
use crate::service::{HostService, ProcessHandle, ProcessInfo, ServiceCode, StdioHandles};
use crate::timeouts;

/// Terminal outcome shared by every `wait` caller.
#[derive(Debug, Clone)]
struct ProcessExit {
    code: i32,
    error: Option<Error>,
}

pub struct Process {
    system_id: String,
    pid: u32,
    host: Arc<dyn HostService>,
    engine: Arc<DispatchEngine>,
    // Shared for every operation, exclusive only to retire the handle in
    // close().
    handle: RwLock<Option<ProcessHandle>>,
    token: Token,
    stdio: Mutex<StdioHandles>,
    gate: Arc<WaitGate<ProcessExit>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("system_id", &self.system_id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Proof that the process is attached: holds the shared handle lock for the
/// duration of one operation.
struct AttachedProcess<'a> {
    _guard: RwLockReadGuard<'a, Option<ProcessHandle>>,
    handle: ProcessHandle,
}

impl Process {
    /// Registers the completion token for a created or opened process and
    /// starts its exit watcher. The watcher is started exactly once per
    /// handle because this is the only construction path.
    pub(crate) async fn attach(
        host: Arc<dyn HostService>,
        engine: Arc<DispatchEngine>,
        system_id: String,
        info: ProcessInfo,
        op: &'static str,
    ) -> Result<Arc<Process>> {
        let token = engine.register_process(&system_id, info.pid);
        let registered = host.register_process_callback(info.handle, token);
        if registered.code != ServiceCode::Success {
            engine.unregister(token).await;
            let _ = host.close_process(info.handle);
            return Err(ProcessError::new(
                system_id,
                info.pid,
                op,
                OpError::Service(registered.code),
            )
            .with_events(registered.events)
            .into());
        }

        let process = Arc::new(Process {
            system_id,
            pid: info.pid,
            host,
            engine,
            handle: RwLock::new(Some(info.handle)),
            token,
            stdio: Mutex::new(info.stdio),
            gate: Arc::new(WaitGate::new()),
        });
        process.spawn_exit_watcher();
        Ok(process)
    }

    /// Process id within the compute system.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Id of the owning compute system.
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    fn error(&self, op: &'static str, cause: OpError) -> Error {
        ProcessError::new(&self.system_id, self.pid, op, cause).into()
    }

    /// Takes the shared handle lock, failing with `AlreadyClosed` when the
    /// handle has been retired. The guard is held for the whole operation.
    async fn attached(&self, op: &'static str) -> Result<AttachedProcess<'_>> {
        let guard = self.handle.read().await;
        match *guard {
            Some(handle) => Ok(AttachedProcess {
                _guard: guard,
                handle,
            }),
            None => Err(self.error(op, OpError::AlreadyClosed)),
        }
    }

    /// Sends `options` as a signal to the process.
    ///
    /// Returns `Ok(false)` without delivering when the host reports the
    /// process already gone; the exit notification usually follows, and if it
    /// does not, the wait signal is force-unblocked after a grace period.
    pub async fn signal<S: Serialize>(&self, options: &S) -> Result<bool> {
        let attached = self.attached("Signal").await?;
        let document =
            serde_json::to_string(options).map_err(|err| self.error("Signal", err.into()))?;
        let response = self.host.signal_process(attached.handle, &document);
        self.classify_signal_result(response, "Signal")
    }

    /// Signals the process to terminate without waiting for it.
    pub async fn kill(&self) -> Result<bool> {
        let attached = self.attached("Kill").await?;
        let response = self.host.terminate_process(attached.handle);
        self.classify_signal_result(response, "Kill")
    }

    fn classify_signal_result(
        &self,
        response: crate::service::HostResponse,
        op: &'static str,
    ) -> Result<bool> {
        match response.code {
            ServiceCode::Success => Ok(true),
            ServiceCode::InvalidState
            | ServiceCode::SystemNotFound
            | ServiceCode::ElementNotFound => {
                // The process should be gone but its exit notification has
                // not arrived. Bound how long wait() can block on that race.
                self.force_unblock_after_grace(self.error(op, OpError::Service(response.code)));
                Ok(false)
            }
            code => Err(self.error(op, OpError::Service(code))),
        }
    }

    fn force_unblock_after_grace(&self, cause: Error) {
        if self.gate.peek().is_some() {
            // The exit notification already arrived.
            return;
        }
        let gate = Arc::clone(&self.gate);
        let system_id = self.system_id.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            tokio::time::sleep(timeouts::SIGNAL_GRACE).await;
            if gate.close(ProcessExit {
                code: -1,
                error: Some(cause),
            }) {
                warn!(system_id = %system_id, pid, "force unblocking process waits");
            }
        });
    }

    /// Resizes the process console.
    pub async fn resize_console(&self, width: u16, height: u16) -> Result<()> {
        let attached = self.attached("ResizeConsole").await?;
        self.modify(
            attached.handle,
            &ProcessModifyRequest::console_size(width, height),
            "ResizeConsole",
        )
    }

    /// Asks the host to close the process's stdin, then closes the local
    /// write side if this process still owns it.
    pub async fn close_stdin(&self) -> Result<()> {
        let attached = self.attached("CloseStdin").await?;
        self.modify(
            attached.handle,
            &ProcessModifyRequest::close_handle(StdioStream::StdIn),
            "CloseStdin",
        )?;
        self.stdio.lock().stdin.take();
        Ok(())
    }

    fn modify(
        &self,
        handle: ProcessHandle,
        request: &ProcessModifyRequest,
        op: &'static str,
    ) -> Result<()> {
        let document =
            serde_json::to_string(request).map_err(|err| self.error(op, err.into()))?;
        let response = self.host.modify_process(handle, &document);
        if response.code != ServiceCode::Success {
            return Err(ProcessError::new(
                &self.system_id,
                self.pid,
                op,
                OpError::Service(response.code),
            )
            .with_events(response.events)
            .into());
        }
        Ok(())
    }

    /// Surrenders the stdio streams. Each stream is handed out at most once;
    /// dropping them does not close the host-side pipes.
    pub fn take_stdio(&self) -> StdioHandles {
        let mut stdio = self.stdio.lock();
        StdioHandles {
            stdin: stdio.stdin.take(),
            stdout: stdio.stdout.take(),
            stderr: stdio.stderr.take(),
        }
    }

    /// Waits for the process exit notification indefinitely, fetches the
    /// exit code, and retires the wait signal. Spawned exactly once per
    /// handle from `attach`.
    fn spawn_exit_watcher(self: &Arc<Self>) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match process
                .engine
                .wait(process.token, NotificationKind::Exited, None)
                .await
            {
                Ok(Notification {
                    status: NotifyStatus::Success | NotifyStatus::UnexpectedExit,
                    ..
                }) => process.fetch_exit_code().await,
                Ok(Notification {
                    status: NotifyStatus::Failed(code),
                    ..
                }) => ProcessExit {
                    code: -1,
                    error: Some(process.error("Wait", OpError::Notification(code))),
                },
                // close() unregistered the waiter and owns the gate.
                Err(WaitError::Gone) => return,
                Err(WaitError::Timeout(elapsed)) => ProcessExit {
                    code: -1,
                    error: Some(process.error("Wait", OpError::Timeout(elapsed))),
                },
            };
            if process.gate.close(outcome) {
                debug!(system_id = %process.system_id, pid = process.pid, "process exited");
            }
        });
    }

    async fn fetch_exit_code(&self) -> ProcessExit {
        // Guard against a racing close(): a retired handle leaves the
        // sentinel exit code in place.
        let guard = self.handle.read().await;
        let Some(handle) = *guard else {
            return ProcessExit {
                code: -1,
                error: None,
            };
        };
        let response = self.host.get_process_properties(handle);
        if response.code != ServiceCode::Success {
            return ProcessExit {
                code: -1,
                error: Some(self.error("Wait", OpError::Service(response.code))),
            };
        }
        let Some(document) = response.document else {
            return ProcessExit {
                code: -1,
                error: Some(self.error("Wait", OpError::MissingDocument)),
            };
        };
        match serde_json::from_str::<ProcessStatus>(&document) {
            Ok(status) if status.last_wait_result != 0 => {
                warn!(
                    system_id = %self.system_id,
                    pid = self.pid,
                    wait_result = status.last_wait_result,
                    "non-zero last wait result"
                );
                ProcessExit {
                    code: -1,
                    error: None,
                }
            }
            Ok(status) => ProcessExit {
                code: status.exit_code,
                error: None,
            },
            Err(err) => ProcessExit {
                code: -1,
                error: Some(self.error("Wait", OpError::Decode(err.to_string()))),
            },
        }
    }

    /// Waits for the process to exit. Safe to call repeatedly and
    /// concurrently; every caller observes the same outcome.
    pub async fn wait(&self) -> Result<()> {
        match &self.gate.wait().await.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Non-blocking exit code read. Errors with `NotExited` while the
    /// process is still running — unlike [`Process::wait`], this never
    /// blocks.
    pub fn exit_code(&self) -> Result<i32> {
        match self.gate.peek() {
            Some(exit) => match &exit.error {
                Some(err) => Err(err.clone()),
                None => Ok(exit.code),
            },
            None => Err(self.error("ExitCode", OpError::NotExited)),
        }
    }

    /// Releases the handle, completion token, and any stdio streams still
    /// owned. Idempotent; does not kill or wait on the process.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.handle.write().await;
        let Some(handle) = *guard else { return Ok(()) };

        {
            let mut stdio = self.stdio.lock();
            stdio.stdin.take();
            stdio.stdout.take();
            stdio.stderr.take();
        }

        let unregistered = self.host.unregister_process_callback(handle);
        if unregistered.code != ServiceCode::Success {
            return Err(ProcessError::new(
                &self.system_id,
                self.pid,
                "Close",
                OpError::Service(unregistered.code),
            )
            .with_events(unregistered.events)
            .into());
        }
        self.engine.unregister(self.token).await;

        let closed = self.host.close_process(handle);
        if closed.code != ServiceCode::Success {
            return Err(ProcessError::new(
                &self.system_id,
                self.pid,
                "Close",
                OpError::Service(closed.code),
            )
            .with_events(closed.events)
            .into());
        }
        *guard = None;
        self.gate.close(ProcessExit {
            code: -1,
            error: Some(self.error("Wait", OpError::AlreadyClosed)),
        });
        Ok(())
    }
}
