//! Compute system handle and lifecycle.
//!
//! A [`ComputeSystem`] wraps one native handle from the host virtualization
//! service. Host calls look synchronous to callers but internally suspend on
//! the dispatch engine until the matching completion notification arrives or
//! an operation-specific deadline elapses. One background task per attached
//! handle waits for the exit notification and retires the wait signal exactly
//! once; `wait` is safe to call any number of times from any task.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::{Error, OpError, Result, SystemError};
use crate::notify::{
    DispatchEngine, Notification, NotificationKind, NotifyStatus, Token, WaitError, WaitGate,
};
use crate::process::Process;
use crate::schema::{PropertyQuery, PropertyType, SystemProperties};
use crate::service::{HostService, ServiceCode, SystemHandle};
use crate::{throttle, timeouts};

pub struct ComputeSystem {
    id: String,
    host: Arc<dyn HostService>,
    engine: Arc<DispatchEngine>,
    // Shared for every operation, exclusive only to retire the handle in
    // close(). Guards may be held across notification waits.
    handle: RwLock<Option<SystemHandle>>,
    token: Token,
    gate: WaitGate<std::result::Result<(), Error>>,
    exit_error: OnceLock<Error>,
    os: OnceLock<String>,
    system_type: OnceLock<String>,
}

impl std::fmt::Debug for ComputeSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeSystem")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Proof that the system is attached: holds the shared handle lock for the
/// duration of one operation.
pub(crate) struct Attached<'a> {
    _guard: RwLockReadGuard<'a, Option<SystemHandle>>,
    pub(crate) handle: SystemHandle,
}

impl ComputeSystem {
    /// Creates a new compute system from `document` but does not start it.
    ///
    /// If the host accepts the request as pending, waits for the "created"
    /// notification under the create deadline; on timeout the half-created
    /// system is terminated best-effort so no host-side VM leaks.
    pub async fn create<S: Serialize>(
        host: Arc<dyn HostService>,
        engine: Arc<DispatchEngine>,
        id: &str,
        document: &S,
    ) -> Result<Arc<ComputeSystem>> {
        let document = serde_json::to_string(document)
            .map_err(|err| SystemError::new(id, "Create", err.into()))?;
        debug!(system_id = %id, document = %document, "creating compute system");

        let (response, handle) = host.create_system(id, &document);
        let handle = match response.code {
            ServiceCode::Success | ServiceCode::Pending => handle.ok_or_else(|| {
                SystemError::new(id, "Create", OpError::MissingDocument)
                    .with_document(document.clone())
            })?,
            code => {
                return Err(SystemError::new(id, "Create", OpError::Service(code))
                    .with_document(document)
                    .with_events(response.events)
                    .into())
            }
        };

        let system = Self::attach(host, engine, id, handle, "Create").await?;
        if response.code == ServiceCode::Pending {
            if let Err(err) = system
                .wait_for_completion(NotificationKind::Created, timeouts::system_create(), "Create")
                .await
            {
                if err.is_timeout() {
                    // Terminate the compute system if it still exists; a
                    // failure here is ignored.
                    let _ = system.host.terminate_system(handle, "");
                }
                let _ = system.close().await;
                return Err(match err {
                    Error::System(inner) => inner.with_document(document).into(),
                    other => other,
                });
            }
        }
        system.finish_attach().await?;
        Ok(system)
    }

    /// Opens an existing compute system by id.
    pub async fn open(
        host: Arc<dyn HostService>,
        engine: Arc<DispatchEngine>,
        id: &str,
    ) -> Result<Arc<ComputeSystem>> {
        let (response, handle) = host.open_system(id);
        let handle = match response.code {
            ServiceCode::Success => handle.ok_or_else(|| {
                Error::from(SystemError::new(id, "Open", OpError::MissingDocument))
            })?,
            code => {
                return Err(SystemError::new(id, "Open", OpError::Service(code))
                    .with_events(response.events)
                    .into())
            }
        };

        let system = Self::attach(host, engine, id, handle, "Open").await?;
        system.finish_attach().await?;
        Ok(system)
    }

    /// Registers the completion token for `handle` and builds the system in
    /// its attached state.
    async fn attach(
        host: Arc<dyn HostService>,
        engine: Arc<DispatchEngine>,
        id: &str,
        handle: SystemHandle,
        op: &'static str,
    ) -> Result<Arc<ComputeSystem>> {
        let token = engine.register_system(id);
        let registered = host.register_system_callback(handle, token);
        if registered.code != ServiceCode::Success {
            // Terminate the compute system if it still exists; a failure
            // here is ignored.
            let _ = host.terminate_system(handle, "");
            engine.unregister(token).await;
            let _ = host.close_system(handle);
            return Err(SystemError::new(id, op, OpError::Service(registered.code))
                .with_events(registered.events)
                .into());
        }

        Ok(Arc::new(ComputeSystem {
            id: id.to_string(),
            host,
            engine,
            handle: RwLock::new(Some(handle)),
            token,
            gate: WaitGate::new(),
            exit_error: OnceLock::new(),
            os: OnceLock::new(),
            system_type: OnceLock::new(),
        }))
    }

    /// Completes attachment: starts the exit watcher and caches the resolved
    /// OS and system-type classification. Both happen exactly once per
    /// attached handle because this is only reachable from `create`/`open`.
    async fn finish_attach(self: &Arc<Self>) -> Result<()> {
        self.spawn_exit_watcher();
        if let Err(err) = self.cache_properties().await {
            let _ = self.close().await;
            return Err(err);
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lowercase operating system of the compute system, `"linux"` or
    /// `"windows"`. Empty until attachment completes.
    pub fn os(&self) -> &str {
        self.os.get().map(String::as_str).unwrap_or("")
    }

    /// Lowercase system-type classification reported by the host.
    pub fn system_type(&self) -> &str {
        self.system_type.get().map(String::as_str).unwrap_or("")
    }

    async fn cache_properties(&self) -> Result<()> {
        let properties = self.properties(&[]).await?;
        let system_type = properties.system_type.to_lowercase();
        let mut os = properties
            .runtime_os_type
            .unwrap_or_default()
            .to_lowercase();
        if os.is_empty() && system_type == "container" {
            // Older hosts did not report the OS but only supported Windows
            // containers.
            os = "windows".to_string();
        }
        let _ = self.system_type.set(system_type);
        let _ = self.os.set(os);
        Ok(())
    }

    fn error(&self, op: &'static str, cause: OpError) -> Error {
        SystemError::new(&self.id, op, cause).into()
    }

    /// Takes the shared handle lock, failing with `AlreadyClosed` when the
    /// handle has been retired.
    pub(crate) async fn attached(&self, op: &'static str) -> Result<Attached<'_>> {
        let guard = self.handle.read().await;
        match *guard {
            Some(handle) => Ok(Attached {
                _guard: guard,
                handle,
            }),
            None => Err(self.error(op, OpError::AlreadyClosed)),
        }
    }

    async fn wait_for_completion(
        &self,
        kind: NotificationKind,
        deadline: Duration,
        op: &'static str,
    ) -> Result<()> {
        match self.engine.wait(self.token, kind, Some(deadline)).await {
            Ok(notification) => match notification.status {
                NotifyStatus::Success | NotifyStatus::UnexpectedExit => Ok(()),
                NotifyStatus::Failed(code) => Err(self.error(op, OpError::Notification(code))),
            },
            Err(WaitError::Timeout(elapsed)) => Err(self.error(op, OpError::Timeout(elapsed))),
            Err(WaitError::Gone) => Err(self.error(op, OpError::HandleInvalidated)),
        }
    }

    /// Starts the compute system, subject to the process-wide start throttle.
    pub async fn start(&self) -> Result<()> {
        let attached = self.attached("Start").await?;
        let _permit = throttle::global().acquire().await;

        let response = self.host.start_system(attached.handle, "");
        match response.code {
            ServiceCode::Success => Ok(()),
            ServiceCode::Pending => {
                let completed = self
                    .wait_for_completion(
                        NotificationKind::Started,
                        timeouts::system_start(),
                        "Start",
                    )
                    .await;
                if let Err(err) = completed {
                    if err.is_timeout() {
                        // Best-effort cleanup of the half-started system.
                        let _ = self.host.terminate_system(attached.handle, "");
                    }
                    return Err(err);
                }
                Ok(())
            }
            code => Err(SystemError::new(&self.id, "Start", OpError::Service(code))
                .with_events(response.events)
                .into()),
        }
    }

    /// Requests an orderly shutdown. Completion is observed by the exit
    /// watcher, not here; "already stopped", "does not exist" and "operation
    /// pending" all count as success.
    pub async fn shutdown(&self) -> Result<()> {
        let guard = self.handle.read().await;
        let Some(handle) = *guard else { return Ok(()) };
        let response = self.host.shutdown_system(handle, "");
        self.classify_stop_result(response, "Shutdown")
    }

    /// Requests an immediate terminate. Same idempotent result classes as
    /// [`ComputeSystem::shutdown`].
    pub async fn terminate(&self) -> Result<()> {
        let guard = self.handle.read().await;
        let Some(handle) = *guard else { return Ok(()) };
        let response = self.host.terminate_system(handle, "");
        self.classify_stop_result(response, "Terminate")
    }

    fn classify_stop_result(
        &self,
        response: crate::service::HostResponse,
        op: &'static str,
    ) -> Result<()> {
        match response.code {
            ServiceCode::Success
            | ServiceCode::Pending
            | ServiceCode::AlreadyStopped
            | ServiceCode::SystemNotFound => Ok(()),
            code => Err(SystemError::new(&self.id, op, OpError::Service(code))
                .with_events(response.events)
                .into()),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        let attached = self.attached("Pause").await?;
        let response = self.host.pause_system(attached.handle, "");
        match response.code {
            ServiceCode::Success => Ok(()),
            ServiceCode::Pending => {
                self.wait_for_completion(NotificationKind::Paused, timeouts::system_pause(), "Pause")
                    .await
            }
            code => Err(SystemError::new(&self.id, "Pause", OpError::Service(code))
                .with_events(response.events)
                .into()),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let attached = self.attached("Resume").await?;
        let response = self.host.resume_system(attached.handle, "");
        match response.code {
            ServiceCode::Success => Ok(()),
            ServiceCode::Pending => {
                self.wait_for_completion(
                    NotificationKind::Resumed,
                    timeouts::system_resume(),
                    "Resume",
                )
                .await
            }
            code => Err(SystemError::new(&self.id, "Resume", OpError::Service(code))
                .with_events(response.events)
                .into()),
        }
    }

    /// Queries system properties from the host.
    pub async fn properties(&self, types: &[PropertyType]) -> Result<SystemProperties> {
        let attached = self.attached("Properties").await?;
        let query = serde_json::to_string(&PropertyQuery {
            property_types: types.to_vec(),
        })
        .map_err(|err| self.error("Properties", err.into()))?;

        let response = self.host.get_system_properties(attached.handle, &query);
        if response.code != ServiceCode::Success {
            return Err(
                SystemError::new(&self.id, "Properties", OpError::Service(response.code))
                    .with_events(response.events)
                    .into(),
            );
        }
        let document = response
            .document
            .ok_or_else(|| self.error("Properties", OpError::MissingDocument))?;
        serde_json::from_str(&document)
            .map_err(|err| self.error("Properties", OpError::Decode(err.to_string())))
    }

    /// Sends a settings-modification request. The serialized request travels
    /// with any resulting error for diagnostics.
    pub async fn modify<S: Serialize>(&self, request: &S) -> Result<()> {
        let attached = self.attached("Modify").await?;
        self.modify_on(&attached, request)
    }

    /// Modify against a handle lock the caller already holds. Lets the
    /// resource façade take the handle lock before its ledger lock.
    pub(crate) fn modify_on<S: Serialize>(&self, attached: &Attached<'_>, request: &S) -> Result<()> {
        let document =
            serde_json::to_string(request).map_err(|err| self.error("Modify", err.into()))?;
        debug!(system_id = %self.id, document = %document, "modifying compute system");

        let response = self.host.modify_system(attached.handle, &document);
        if response.code != ServiceCode::Success {
            return Err(
                SystemError::new(&self.id, "Modify", OpError::Service(response.code))
                    .with_document(document)
                    .with_events(response.events)
                    .into(),
            );
        }
        Ok(())
    }

    /// Launches a process in the compute system, keeping its stdio streams.
    pub async fn create_process<S: Serialize>(&self, config: &S) -> Result<Arc<Process>> {
        self.launch_process(config, true).await
    }

    /// Launches a process, discarding the stdio streams the host returns.
    pub async fn create_process_no_stdio<S: Serialize>(&self, config: &S) -> Result<Arc<Process>> {
        self.launch_process(config, false).await
    }

    async fn launch_process<S: Serialize>(&self, config: &S, keep_stdio: bool) -> Result<Arc<Process>> {
        let attached = self.attached("CreateProcess").await?;
        let document = serde_json::to_string(config)
            .map_err(|err| self.error("CreateProcess", err.into()))?;
        debug!(system_id = %self.id, document = %document, "creating process");

        let (response, info) = self.host.create_process(attached.handle, &document);
        if response.code != ServiceCode::Success {
            return Err(SystemError::new(
                &self.id,
                "CreateProcess",
                OpError::Service(response.code),
            )
            .with_document(document)
            .with_events(response.events)
            .into());
        }
        let mut info = info.ok_or_else(|| self.error("CreateProcess", OpError::MissingDocument))?;
        if !keep_stdio {
            // The handles are not cached on the process; drop them so they
            // don't leak.
            info.stdio = Default::default();
        }
        debug!(system_id = %self.id, pid = info.pid, "process created");

        Process::attach(
            Arc::clone(&self.host),
            Arc::clone(&self.engine),
            self.id.clone(),
            info,
            "CreateProcess",
        )
        .await
    }

    /// Opens an existing process in the compute system by pid.
    pub async fn open_process(&self, pid: u32) -> Result<Arc<Process>> {
        let attached = self.attached("OpenProcess").await?;
        let (response, handle) = self.host.open_process(attached.handle, pid);
        if response.code != ServiceCode::Success {
            return Err(crate::error::ProcessError::new(
                &self.id,
                pid,
                "OpenProcess",
                OpError::Service(response.code),
            )
            .with_events(response.events)
            .into());
        }
        let handle = handle.ok_or_else(|| self.error("OpenProcess", OpError::MissingDocument))?;

        Process::attach(
            Arc::clone(&self.host),
            Arc::clone(&self.engine),
            self.id.clone(),
            crate::service::ProcessInfo {
                handle,
                pid,
                stdio: Default::default(),
            },
            "OpenProcess",
        )
        .await
    }

    /// Waits for the exit notification indefinitely and retires the wait
    /// signal. Spawned exactly once per attached handle from `finish_attach`;
    /// `wait` remains safe to call many times.
    fn spawn_exit_watcher(self: &Arc<Self>) {
        let system = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match system
                .engine
                .wait(system.token, NotificationKind::Exited, None)
                .await
            {
                Ok(Notification {
                    status: NotifyStatus::Success,
                    ..
                }) => Ok(()),
                Ok(Notification {
                    status: NotifyStatus::UnexpectedExit,
                    ..
                }) => {
                    warn!(system_id = %system.id, "unexpected compute system exit");
                    let _ = system
                        .exit_error
                        .set(system.error("Wait", OpError::UnexpectedExit));
                    Ok(())
                }
                Ok(Notification {
                    status: NotifyStatus::Failed(code),
                    ..
                }) => Err(system.error("Wait", OpError::Notification(code))),
                // close() unregistered the waiter and owns the gate.
                Err(WaitError::Gone) => return,
                Err(WaitError::Timeout(elapsed)) => {
                    Err(system.error("Wait", OpError::Timeout(elapsed)))
                }
            };
            if system.gate.close(outcome) {
                debug!(system_id = %system.id, "compute system exited");
            }
        });
    }

    /// Waits for the compute system to shut down or terminate. Every caller
    /// observes the same terminal outcome.
    pub async fn wait(&self) -> Result<()> {
        self.gate.wait().await.clone()
    }

    /// Non-blocking: the reason the system stopped, or `NotExited` while it
    /// is still running. A clean wait with a recorded unexpected-exit error
    /// reports that error.
    pub fn exit_error(&self) -> Result<()> {
        match self.gate.peek() {
            Some(Err(err)) => Err(err.clone()),
            Some(Ok(())) => match self.exit_error.get() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
            None => Err(self.error("ExitError", OpError::NotExited)),
        }
    }

    /// Releases the native handle and completion token. Idempotent: a second
    /// close returns `Ok` without touching anything. Does not terminate or
    /// wait for the system.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.handle.write().await;
        let Some(handle) = *guard else { return Ok(()) };

        let unregistered = self.host.unregister_system_callback(handle);
        if unregistered.code != ServiceCode::Success {
            return Err(
                SystemError::new(&self.id, "Close", OpError::Service(unregistered.code))
                    .with_events(unregistered.events)
                    .into(),
            );
        }
        self.engine.unregister(self.token).await;

        let closed = self.host.close_system(handle);
        if closed.code != ServiceCode::Success {
            return Err(
                SystemError::new(&self.id, "Close", OpError::Service(closed.code))
                    .with_events(closed.events)
                    .into(),
            );
        }
        *guard = None;
        self.gate
            .close(Err(self.error("Wait", OpError::AlreadyClosed)));
        Ok(())
    }
}
