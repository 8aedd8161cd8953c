//! In-memory host service double.
//!
//! Implements the host call surface against a table of fake systems and
//! processes, feeding completion notifications straight into the dispatch
//! engine the way the production adapter would. Tests drive exits explicitly
//! through `exit_system`/`exit_process` and tweak result codes via
//! `configure`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};

use hostcompute::notify::Notification;
use hostcompute::service::{
    HostResponse, HostService, ProcessHandle, ProcessInfo, ServiceCode, StdioHandles, SystemHandle,
};
use hostcompute::{DispatchEngine, NotificationKind};

pub struct Behavior {
    pub complete_create: bool,
    pub complete_start: bool,
    pub complete_pause: bool,
    pub complete_resume: bool,
    pub os: &'static str,
    pub system_type: &'static str,
    pub shutdown_code: ServiceCode,
    pub signal_code: ServiceCode,
    pub modify_code: ServiceCode,
    pub modify_failures_remaining: u32,
    pub exit_code: i32,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            complete_create: true,
            complete_start: true,
            complete_pause: true,
            complete_resume: true,
            os: "Windows",
            system_type: "VirtualMachine",
            shutdown_code: ServiceCode::Success,
            signal_code: ServiceCode::Success,
            modify_code: ServiceCode::Success,
            modify_failures_remaining: 0,
            exit_code: 0,
        }
    }
}

struct FakeSystem {
    id: String,
    token: Option<u64>,
    pending_create: bool,
}

struct FakeProcess {
    pid: u32,
    token: Option<u64>,
    peers: Option<PeerStdio>,
}

/// The host-side ends of a fake process's stdio pipes.
pub struct PeerStdio {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

#[derive(Clone)]
pub struct Call {
    pub op: &'static str,
    pub document: Option<String>,
}

struct Inner {
    next_handle: u64,
    next_pid: u32,
    systems: HashMap<SystemHandle, FakeSystem>,
    processes: HashMap<ProcessHandle, FakeProcess>,
    calls: Vec<Call>,
    behavior: Behavior,
}

pub struct FakeHost {
    engine: Arc<DispatchEngine>,
    inner: Mutex<Inner>,
}

impl FakeHost {
    pub fn new(engine: Arc<DispatchEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            inner: Mutex::new(Inner {
                next_handle: 1,
                next_pid: 100,
                systems: HashMap::new(),
                processes: HashMap::new(),
                calls: Vec::new(),
                behavior: Behavior::default(),
            }),
        })
    }

    pub fn configure(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.inner.lock().behavior)
    }

    pub fn calls_of(&self, op: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    pub fn last_document(&self, op: &str) -> Option<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .rev()
            .find(|call| call.op == op)
            .and_then(|call| call.document.clone())
    }

    pub fn exit_system(&self, id: &str) {
        self.dispatch_system(id, Notification::success());
    }

    pub fn exit_system_unexpected(&self, id: &str) {
        self.dispatch_system(id, Notification::unexpected_exit());
    }

    fn dispatch_system(&self, id: &str, notification: Notification) {
        let token = self
            .inner
            .lock()
            .systems
            .values()
            .find(|system| system.id == id)
            .and_then(|system| system.token);
        if let Some(token) = token {
            self.engine
                .dispatch(token, NotificationKind::Exited, notification);
        }
    }

    pub fn exit_process(&self, pid: u32) {
        let token = self
            .inner
            .lock()
            .processes
            .values()
            .find(|process| process.pid == pid)
            .and_then(|process| process.token);
        if let Some(token) = token {
            self.engine
                .dispatch(token, NotificationKind::Exited, Notification::success());
        }
    }

    pub fn take_peer_stdio(&self, pid: u32) -> Option<PeerStdio> {
        self.inner
            .lock()
            .processes
            .values_mut()
            .find(|process| process.pid == pid)
            .and_then(|process| process.peers.take())
    }

    fn record(&self, op: &'static str, document: Option<&str>) {
        self.inner.lock().calls.push(Call {
            op,
            document: document.map(str::to_string),
        });
    }
}

impl HostService for FakeHost {
    fn create_system(&self, id: &str, document: &str) -> (HostResponse, Option<SystemHandle>) {
        self.record("CreateSystem", Some(document));
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.systems.insert(
            handle,
            FakeSystem {
                id: id.to_string(),
                token: None,
                pending_create: true,
            },
        );
        (HostResponse::pending(), Some(handle))
    }

    fn open_system(&self, id: &str) -> (HostResponse, Option<SystemHandle>) {
        self.record("OpenSystem", None);
        let inner = self.inner.lock();
        match inner
            .systems
            .iter()
            .find(|(_, system)| system.id == id)
            .map(|(&handle, _)| handle)
        {
            Some(handle) => (HostResponse::success(), Some(handle)),
            None => (HostResponse::new(ServiceCode::SystemNotFound), None),
        }
    }

    fn register_system_callback(&self, handle: SystemHandle, token: u64) -> HostResponse {
        self.record("RegisterSystemCallback", None);
        let (pending, complete) = {
            let mut inner = self.inner.lock();
            let complete = inner.behavior.complete_create;
            match inner.systems.get_mut(&handle) {
                Some(system) => {
                    system.token = Some(token);
                    (system.pending_create, complete)
                }
                None => return HostResponse::new(ServiceCode::SystemNotFound),
            }
        };
        if pending && complete {
            self.engine
                .dispatch(token, NotificationKind::Created, Notification::success());
        }
        HostResponse::success()
    }

    fn unregister_system_callback(&self, _handle: SystemHandle) -> HostResponse {
        self.record("UnregisterSystemCallback", None);
        HostResponse::success()
    }

    fn start_system(&self, handle: SystemHandle, _options: &str) -> HostResponse {
        self.record("StartSystem", None);
        let (token, complete) = {
            let inner = self.inner.lock();
            (
                inner.systems.get(&handle).and_then(|system| system.token),
                inner.behavior.complete_start,
            )
        };
        if let (Some(token), true) = (token, complete) {
            self.engine
                .dispatch(token, NotificationKind::Started, Notification::success());
        }
        HostResponse::pending()
    }

    fn shutdown_system(&self, _handle: SystemHandle, _options: &str) -> HostResponse {
        self.record("ShutdownSystem", None);
        HostResponse::new(self.inner.lock().behavior.shutdown_code)
    }

    fn terminate_system(&self, _handle: SystemHandle, _options: &str) -> HostResponse {
        self.record("TerminateSystem", None);
        HostResponse::success()
    }

    fn pause_system(&self, handle: SystemHandle, _options: &str) -> HostResponse {
        self.record("PauseSystem", None);
        let (token, complete) = {
            let inner = self.inner.lock();
            (
                inner.systems.get(&handle).and_then(|system| system.token),
                inner.behavior.complete_pause,
            )
        };
        if let (Some(token), true) = (token, complete) {
            self.engine
                .dispatch(token, NotificationKind::Paused, Notification::success());
        }
        HostResponse::pending()
    }

    fn resume_system(&self, handle: SystemHandle, _options: &str) -> HostResponse {
        self.record("ResumeSystem", None);
        let (token, complete) = {
            let inner = self.inner.lock();
            (
                inner.systems.get(&handle).and_then(|system| system.token),
                inner.behavior.complete_resume,
            )
        };
        if let (Some(token), true) = (token, complete) {
            self.engine
                .dispatch(token, NotificationKind::Resumed, Notification::success());
        }
        HostResponse::pending()
    }

    fn get_system_properties(&self, handle: SystemHandle, _query: &str) -> HostResponse {
        self.record("GetSystemProperties", None);
        let inner = self.inner.lock();
        let id = inner
            .systems
            .get(&handle)
            .map(|system| system.id.clone())
            .unwrap_or_default();
        let document = serde_json::json!({
            "Id": id,
            "SystemType": inner.behavior.system_type,
            "RuntimeOsType": inner.behavior.os,
            "State": "Running",
        });
        HostResponse::success().with_document(document.to_string())
    }

    fn modify_system(&self, _handle: SystemHandle, settings: &str) -> HostResponse {
        self.record("ModifySystem", Some(settings));
        let mut inner = self.inner.lock();
        if inner.behavior.modify_failures_remaining > 0 {
            inner.behavior.modify_failures_remaining -= 1;
            return HostResponse::new(inner.behavior.modify_code);
        }
        HostResponse::success()
    }

    fn close_system(&self, handle: SystemHandle) -> HostResponse {
        self.record("CloseSystem", None);
        self.inner.lock().systems.remove(&handle);
        HostResponse::success()
    }

    fn create_process(
        &self,
        _handle: SystemHandle,
        config: &str,
    ) -> (HostResponse, Option<ProcessInfo>) {
        self.record("CreateProcess", Some(config));
        let mut inner = self.inner.lock();
        let pid = inner.next_pid;
        inner.next_pid += 1;
        let handle = inner.next_handle;
        inner.next_handle += 1;

        let (stdin_client, stdin_host) = duplex(4096);
        let (stdout_client, stdout_host) = duplex(4096);
        let (stderr_client, stderr_host) = duplex(4096);
        inner.processes.insert(
            handle,
            FakeProcess {
                pid,
                token: None,
                peers: Some(PeerStdio {
                    stdin: stdin_host,
                    stdout: stdout_host,
                    stderr: stderr_host,
                }),
            },
        );

        (
            HostResponse::success(),
            Some(ProcessInfo {
                handle,
                pid,
                stdio: StdioHandles {
                    stdin: Some(Box::new(stdin_client)),
                    stdout: Some(Box::new(stdout_client)),
                    stderr: Some(Box::new(stderr_client)),
                },
            }),
        )
    }

    fn open_process(
        &self,
        _handle: SystemHandle,
        pid: u32,
    ) -> (HostResponse, Option<ProcessHandle>) {
        self.record("OpenProcess", None);
        let inner = self.inner.lock();
        match inner
            .processes
            .iter()
            .find(|(_, process)| process.pid == pid)
            .map(|(&handle, _)| handle)
        {
            Some(handle) => (HostResponse::success(), Some(handle)),
            None => (HostResponse::new(ServiceCode::ElementNotFound), None),
        }
    }

    fn register_process_callback(&self, handle: ProcessHandle, token: u64) -> HostResponse {
        self.record("RegisterProcessCallback", None);
        match self.inner.lock().processes.get_mut(&handle) {
            Some(process) => {
                process.token = Some(token);
                HostResponse::success()
            }
            None => HostResponse::new(ServiceCode::ElementNotFound),
        }
    }

    fn unregister_process_callback(&self, _handle: ProcessHandle) -> HostResponse {
        self.record("UnregisterProcessCallback", None);
        HostResponse::success()
    }

    fn signal_process(&self, _handle: ProcessHandle, options: &str) -> HostResponse {
        self.record("SignalProcess", Some(options));
        HostResponse::new(self.inner.lock().behavior.signal_code)
    }

    fn terminate_process(&self, _handle: ProcessHandle) -> HostResponse {
        self.record("TerminateProcess", None);
        HostResponse::new(self.inner.lock().behavior.signal_code)
    }

    fn modify_process(&self, _handle: ProcessHandle, request: &str) -> HostResponse {
        self.record("ModifyProcess", Some(request));
        HostResponse::success()
    }

    fn get_process_properties(&self, handle: ProcessHandle) -> HostResponse {
        self.record("GetProcessProperties", None);
        let inner = self.inner.lock();
        let pid = inner
            .processes
            .get(&handle)
            .map(|process| process.pid)
            .unwrap_or_default();
        let document = serde_json::json!({
            "ProcessId": pid,
            "Exited": true,
            "ExitCode": inner.behavior.exit_code,
            "LastWaitResult": 0,
        });
        HostResponse::success().with_document(document.to_string())
    }

    fn close_process(&self, handle: ProcessHandle) -> HostResponse {
        self.record("CloseProcess", None);
        self.inner.lock().processes.remove(&handle);
        HostResponse::success()
    }
}
