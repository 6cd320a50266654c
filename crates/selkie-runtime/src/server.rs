//! The server: worker registry, routing, placement, shared stores
//!
//! TigerStyle: Single entry point, explicit lifecycle, clean shutdown.
//!
//! The server owns the worker vector; workers own their services. Cyclic
//! references are avoided by addressing everything with ids: a service id
//! names its worker in the high bits, so routing is a shift and an index,
//! with no global table on the hot path. The name map and env store are
//! read-mostly and sit behind reader-writer locks.

use crate::service::{ServiceConf, ServiceFactory};
use crate::worker::{self, SpawnRequest, WorkerCommand, WorkerHandle};
use selkie_core::constants::WORKER_COUNT_MAX;
use selkie_core::message::{PTYPE_ERROR, PTYPE_SYSTEM, PTYPE_UNKNOWN};
use selkie_core::{Buffer, Error, Message, Result, ServiceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// The multi-worker service server
pub struct Server {
    state: AtomicU8,
    exit_code: AtomicI32,
    started_at: Instant,
    time_offset_ms: AtomicI64,
    workers: Vec<Arc<WorkerHandle>>,
    receivers: Mutex<Vec<Option<mpsc::UnboundedReceiver<WorkerCommand>>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    factories: RwLock<HashMap<String, Arc<dyn ServiceFactory>>>,
    unique_names: RwLock<HashMap<String, ServiceId>>,
    env: RwLock<HashMap<String, String>>,
    placement_cursor: AtomicUsize,
    bad_target_logged: AtomicBool,
}

impl Server {
    /// Create a server with `worker_count` workers (not yet running)
    pub fn new(worker_count: usize) -> Result<Arc<Self>> {
        if worker_count == 0 || worker_count > WORKER_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "worker_count",
                format!("must be in 1..={}", WORKER_COUNT_MAX),
            ));
        }
        let mut workers = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for id in 1..=worker_count as u32 {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(Arc::new(WorkerHandle::new(id, tx)));
            receivers.push(Some(rx));
        }
        Ok(Arc::new(Self {
            state: AtomicU8::new(STATE_CREATED),
            exit_code: AtomicI32::new(0),
            started_at: Instant::now(),
            time_offset_ms: AtomicI64::new(0),
            workers,
            receivers: Mutex::new(receivers),
            threads: Mutex::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            unique_names: RwLock::new(HashMap::new()),
            env: RwLock::new(HashMap::new()),
            placement_cursor: AtomicUsize::new(0),
            bad_target_logged: AtomicBool::new(false),
        }))
    }

    /// Register a factory for a service kind
    pub fn register<F: ServiceFactory>(&self, kind: impl Into<String>, factory: F) {
        self.write_lock(&self.factories)
            .insert(kind.into(), Arc::new(factory));
    }

    pub(crate) fn factory(&self, kind: &str) -> Option<Arc<dyn ServiceFactory>> {
        self.read_lock(&self.factories).get(kind).cloned()
    }

    /// Spawn the worker threads
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let previous = self.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if previous.is_err() {
            return Err(Error::internal("server already started"));
        }
        info!(workers = self.workers.len(), "Server starting");
        let mut receivers = self.lock(&self.receivers);
        let mut threads = self.lock(&self.threads);
        for (index, handle) in self.workers.iter().enumerate() {
            let rx = receivers[index]
                .take()
                .ok_or_else(|| Error::internal("worker receiver already taken"))?;
            let server = self.clone();
            let handle = handle.clone();
            let thread = std::thread::Builder::new()
                .name(format!("selkie-worker-{}", handle.id))
                .spawn(move || worker::run_thread(server, handle, rx))
                .map_err(Error::Io)?;
            threads.push(thread);
        }
        Ok(())
    }

    /// Block until every worker has drained and exited; returns the exit code
    pub fn run(&self) -> i32 {
        let threads = std::mem::take(&mut *self.lock(&self.threads));
        for thread in threads {
            let _ = thread.join();
        }
        info!(code = self.exit_code.load(Ordering::SeqCst), "Server stopped");
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Begin shutdown: workers drain, tear down services, then exit
    pub fn stop(&self, code: i32) {
        let previous = self.state.swap(STATE_STOPPING, Ordering::SeqCst);
        if previous == STATE_STOPPING {
            return;
        }
        info!(code, "Server stop requested");
        self.exit_code.store(code, Ordering::SeqCst);
        for handle in &self.workers {
            handle.command(WorkerCommand::Stop);
        }
    }

    pub fn stopping(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPING
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Build and route a message
    pub fn send(
        &self,
        sender: ServiceId,
        receiver: ServiceId,
        payload: Option<Buffer>,
        header: &str,
        session: i32,
        ptype: u8,
    ) -> Result<()> {
        self.send_message(Message::new(sender, receiver, session, ptype, header, payload))
    }

    /// Route a message to its receiver's worker
    ///
    /// A receiver whose worker bits index past the worker vector is dropped
    /// without side effect (logged once per server).
    pub fn send_message(&self, msg: Message) -> Result<()> {
        if msg.ptype() == PTYPE_UNKNOWN {
            return Err(Error::InvalidMessageType {
                ptype: msg.ptype(),
            });
        }
        let receiver = msg.receiver();
        if receiver.is_zero() {
            return Err(Error::InvalidReceiver);
        }
        let Some(handle) = self.worker(receiver.worker_id()) else {
            if !self.bad_target_logged.swap(true, Ordering::Relaxed) {
                warn!(receiver = %receiver, workers = self.workers.len(), "Dropping message for out-of-range worker");
            }
            return Ok(());
        };
        handle.push_message(msg);
        Ok(())
    }

    /// Deliver one shared-payload copy to every live service but the sender
    pub fn broadcast(&self, sender: ServiceId, payload: Buffer, ptype: u8) -> Result<()> {
        if ptype == PTYPE_UNKNOWN {
            return Err(Error::InvalidMessageType { ptype });
        }
        let template = Message::new(sender, ServiceId::ZERO, 0, ptype, "", Some(payload));
        for handle in &self.workers {
            handle.command(WorkerCommand::Broadcast(
                template.broadcast_copy(ServiceId::ZERO),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Service lifecycle
    // =========================================================================

    /// Create a service of a registered kind
    ///
    /// The boot path (`creator` zero and `session` zero) blocks until the
    /// worker reports the id. Otherwise the call returns immediately and
    /// the ack or error arrives on `session`.
    pub fn new_service(
        &self,
        kind: &str,
        conf: ServiceConf,
        creator: ServiceId,
        session: i32,
    ) -> Result<ServiceId> {
        if self.stopping() {
            return Err(Error::ServerStopping);
        }
        let handle = self.place(conf.worker_hint)?;
        let booting = creator.is_zero() && session == 0;
        let (ack_tx, ack_rx) = if booting {
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        handle.command(WorkerCommand::Spawn(SpawnRequest {
            kind: kind.to_string(),
            conf,
            creator,
            session,
            ack: ack_tx,
        }));
        let Some(ack_rx) = ack_rx else {
            return Ok(ServiceId::ZERO);
        };
        let id = ack_rx
            .recv()
            .map_err(|_| Error::internal("worker exited during service creation"))?;
        if id == 0 {
            return Err(Error::ServiceInitFailed {
                kind: kind.to_string(),
                reason: "see worker log".into(),
            });
        }
        Ok(ServiceId::from_raw(id))
    }

    /// Remove a service; the ack arrives on the caller's session
    pub fn remove_service(&self, id: ServiceId, caller: ServiceId, session: i32) -> Result<()> {
        let handle = self
            .worker(id.worker_id())
            .ok_or(Error::WorkerOutOfRange {
                worker_id: id.worker_id(),
                count: self.workers.len(),
            })?;
        handle.command(WorkerCommand::Remove {
            id,
            caller,
            session,
        });
        Ok(())
    }

    /// Explicit hint wins; otherwise the least-loaded unpinned worker,
    /// round-robin on ties
    fn place(&self, hint: u32) -> Result<&Arc<WorkerHandle>> {
        if hint > 0 {
            return self.worker(hint).ok_or(Error::WorkerOutOfRange {
                worker_id: hint,
                count: self.workers.len(),
            });
        }
        let unpinned: Vec<&Arc<WorkerHandle>> = self
            .workers
            .iter()
            .filter(|handle| !handle.pinned.load(Ordering::Relaxed))
            .collect();
        let candidates = if unpinned.is_empty() {
            self.workers.iter().collect()
        } else {
            unpinned
        };
        let minimum = candidates
            .iter()
            .map(|handle| handle.service_count.load(Ordering::Relaxed))
            .min()
            .unwrap_or(0);
        let least: Vec<&Arc<WorkerHandle>> = candidates
            .into_iter()
            .filter(|handle| handle.service_count.load(Ordering::Relaxed) == minimum)
            .collect();
        debug_assert!(!least.is_empty());
        let index = self.placement_cursor.fetch_add(1, Ordering::Relaxed) % least.len();
        Ok(least[index])
    }

    // =========================================================================
    // Names, env, timers
    // =========================================================================

    /// Register a unique name; false when the name is already taken
    pub fn set_unique_service(&self, name: &str, id: ServiceId) -> bool {
        debug_assert!(!id.is_zero());
        let mut names = self.write_lock(&self.unique_names);
        if names.contains_key(name) {
            return false;
        }
        names.insert(name.to_string(), id);
        true
    }

    /// Resolve a unique name; zero when unknown
    pub fn get_unique_service(&self, name: &str) -> ServiceId {
        self.read_lock(&self.unique_names)
            .get(name)
            .copied()
            .unwrap_or(ServiceId::ZERO)
    }

    pub(crate) fn release_unique(&self, name: &str, id: ServiceId) {
        let mut names = self.write_lock(&self.unique_names);
        if names.get(name) == Some(&id) {
            names.remove(name);
        }
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.write_lock(&self.env)
            .insert(key.to_string(), value.to_string());
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.read_lock(&self.env).get(key).cloned()
    }

    /// Schedule a timeout on the service's worker; 0 when the id is bogus
    pub fn timeout(&self, delay_ms: u64, service: ServiceId) -> u32 {
        match self.worker(service.worker_id()) {
            Some(handle) => handle.schedule_timer(service, delay_ms),
            None => {
                warn!(service_id = %service, "Timeout for out-of-range worker ignored");
                0
            }
        }
    }

    /// Lazily cancel a timer on the service's worker
    pub fn remove_timer(&self, service: ServiceId, timer_id: u32) {
        if let Some(handle) = self.worker(service.worker_id()) {
            handle.cancel_timer(timer_id);
        }
    }

    /// Ask a worker for its service listing, answered on `session`
    pub fn scan_services(&self, caller: ServiceId, worker_id: u32, session: i32) -> Result<()> {
        let handle = self.worker(worker_id).ok_or(Error::WorkerOutOfRange {
            worker_id,
            count: self.workers.len(),
        })?;
        handle.command(WorkerCommand::Scan { caller, session });
        Ok(())
    }

    /// Administrative command strings, answered on the caller's session
    pub fn runcmd(&self, caller: ServiceId, command: &str, session: i32) {
        let answer: std::result::Result<String, String> = match command {
            "worker.count" => Ok(self.workers.len().to_string()),
            "service.count" => Ok(self.service_count().to_string()),
            "server.uptime" => Ok(self.started_at.elapsed().as_secs().to_string()),
            other => Err(format!("unknown command: {}", other)),
        };
        if caller.is_zero() || session == 0 {
            return;
        }
        let msg = match answer {
            Ok(body) => Message::new(
                ServiceId::ZERO,
                caller,
                -session,
                PTYPE_SYSTEM,
                command,
                Some(body.as_str().into()),
            ),
            Err(reason) => Message::new(
                ServiceId::ZERO,
                caller,
                -session,
                PTYPE_ERROR,
                reason,
                None,
            ),
        };
        let _ = self.send_message(msg);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// JSON snapshot of server and per-worker state
    pub fn info(&self) -> String {
        let workers: Vec<serde_json::Value> = self
            .workers
            .iter()
            .map(|handle| {
                serde_json::json!({
                    "id": handle.id,
                    "services": handle.service_count.load(Ordering::Relaxed),
                    "backlog": handle.backlog(),
                    "pinned": handle.pinned.load(Ordering::Relaxed),
                })
            })
            .collect();
        serde_json::json!({
            "sid": self.get_env("sid").unwrap_or_default(),
            "name": self.get_env("name").unwrap_or_default(),
            "uptime_ms": self.started_at.elapsed().as_millis() as u64,
            "service_count": self.service_count(),
            "workers": workers,
        })
        .to_string()
    }

    /// Wall clock in milliseconds, shifted by `adjtime`
    pub fn now(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        wall + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Shift the clock forward; negative offsets are refused
    pub fn adjtime(&self, offset_ms: i64) -> bool {
        if offset_ms <= 0 {
            return false;
        }
        self.time_offset_ms.fetch_add(offset_ms, Ordering::Relaxed);
        true
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn service_count(&self) -> usize {
        self.workers
            .iter()
            .map(|handle| handle.service_count.load(Ordering::Relaxed))
            .sum()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn worker(&self, worker_id: u32) -> Option<&Arc<WorkerHandle>> {
        if worker_id >= 1 && (worker_id as usize) <= self.workers.len() {
            Some(&self.workers[worker_id as usize - 1])
        } else {
            None
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}
