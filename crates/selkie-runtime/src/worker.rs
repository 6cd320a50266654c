//! The worker: one OS thread, one cooperative loop
//!
//! TigerStyle: Single-threaded service execution, explicit command routing.
//!
//! Each worker runs a current-thread tokio runtime inside a `LocalSet`.
//! Its inbound queue carries both routed messages and control commands;
//! socket completions arrive on a second channel fed by the worker's own
//! multiplexer tasks. Handlers execute inline on this thread, one at a
//! time, so FIFO per (sender, receiver) holds by construction.

use crate::prefab::PrefabCache;
use crate::server::Server;
use crate::service::{Service, ServiceConf, ServiceContext};
use crate::timer::TimerWheel;
use selkie_core::constants::{
    SERVICE_SEQUENCE_COUNT_MAX, SOCKET_SWEEP_INTERVAL_MS, WORKER_BATCH_COUNT_MAX,
    WORKER_IDLE_WAIT_MS_MAX,
};
use selkie_core::message::{PTYPE_ERROR, PTYPE_SYSTEM, PTYPE_TIMER};
use selkie_core::{Error, Message, ServiceId};
use selkie_net::SocketMux;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since process start, monotonic
pub(crate) fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

// =============================================================================
// Commands
// =============================================================================

pub(crate) struct SpawnRequest {
    pub kind: String,
    pub conf: ServiceConf,
    pub creator: ServiceId,
    pub session: i32,
    /// Present on the synchronous boot path; receives the new id or 0
    pub ack: Option<std::sync::mpsc::SyncSender<u32>>,
}

pub(crate) enum WorkerCommand {
    /// A routed message for a service on this worker
    Dispatch(Message),
    /// Deliver one shared-payload copy to every live local service
    Broadcast(Message),
    Spawn(SpawnRequest),
    /// Mark a service exiting and queue its teardown
    Remove {
        id: ServiceId,
        caller: ServiceId,
        session: i32,
    },
    /// Synthetic exit marker: run the exit/destroy hooks and drop the record
    Finalize {
        id: ServiceId,
        caller: ServiceId,
        session: i32,
    },
    /// Answer with this worker's service listing
    Scan { caller: ServiceId, session: i32 },
    /// Recompute the sleep deadline (a timer was scheduled cross-thread)
    Wake,
    Stop,
}

// =============================================================================
// Shared handle
// =============================================================================

/// The server-side view of a worker: queue, timers, placement counters
pub(crate) struct WorkerHandle {
    pub id: u32,
    tx: mpsc::UnboundedSender<WorkerCommand>,
    timer: Mutex<TimerWheel>,
    pub service_count: AtomicUsize,
    /// Set while a non-shared service lives here; placement skips the worker
    pub pinned: AtomicBool,
    enqueued: AtomicU64,
    processed: AtomicU64,
}

impl WorkerHandle {
    pub(crate) fn new(id: u32, tx: mpsc::UnboundedSender<WorkerCommand>) -> Self {
        Self {
            id,
            tx,
            timer: Mutex::new(TimerWheel::new(monotonic_ms())),
            service_count: AtomicUsize::new(0),
            pinned: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    pub(crate) fn push_message(&self, msg: Message) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(WorkerCommand::Dispatch(msg));
    }

    pub(crate) fn command(&self, cmd: WorkerCommand) {
        let _ = self.tx.send(cmd);
    }

    /// Messages enqueued but not yet dispatched
    pub(crate) fn backlog(&self) -> u64 {
        self.enqueued
            .load(Ordering::Relaxed)
            .saturating_sub(self.processed.load(Ordering::Relaxed))
    }

    pub(crate) fn note_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn schedule_timer(&self, service: ServiceId, delay_ms: u64) -> u32 {
        let id = self.wheel().schedule(service, delay_ms);
        // nudge the loop so the new deadline is picked up
        let _ = self.tx.send(WorkerCommand::Wake);
        id
    }

    pub(crate) fn cancel_timer(&self, timer_id: u32) {
        self.wheel().remove(timer_id);
    }

    fn wheel(&self) -> MutexGuard<'_, TimerWheel> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Worker-thread state
// =============================================================================

/// Per-invocation service statistics, shared with the handler context
pub(crate) struct ServiceStats {
    cpu_cost_ms: Cell<u64>,
}

impl ServiceStats {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            cpu_cost_ms: Cell::new(0),
        })
    }

    pub(crate) fn add_cpu(&self, ms: u64) {
        self.cpu_cost_ms.set(self.cpu_cost_ms.get() + ms);
    }

    pub(crate) fn cpu_cost_ms(&self) -> u64 {
        self.cpu_cost_ms.get()
    }
}

/// Worker facilities reachable from handler contexts; worker-thread only
pub(crate) struct WorkerCore {
    pub id: u32,
    pub handle: Arc<WorkerHandle>,
    pub socket: SocketMux,
    pub prefabs: RefCell<PrefabCache>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Ready,
    Exiting,
}

struct ServiceSlot {
    name: Rc<str>,
    unique: bool,
    shared: bool,
    state: ServiceState,
    stats: Rc<ServiceStats>,
    handler: Box<dyn Service>,
}

pub(crate) struct Worker {
    server: Arc<Server>,
    core: Rc<WorkerCore>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
    net_rx: mpsc::UnboundedReceiver<Message>,
    /// Keyed by full service id
    services: HashMap<u32, ServiceSlot>,
    /// Creation order, for broadcast delivery and reverse teardown
    order: Vec<u32>,
    next_seq: u32,
    /// Resident non-shared services; the handle stays pinned while > 0
    exclusive_count: usize,
    stopping: bool,
    last_sweep_ms: u64,
}

/// Thread entry: build the runtime and drive the loop to completion
pub(crate) fn run_thread(
    server: Arc<Server>,
    handle: Arc<WorkerHandle>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build worker runtime");
    let local = tokio::task::LocalSet::new();
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let worker = Worker {
        server,
        core: Rc::new(WorkerCore {
            id: handle.id,
            socket: SocketMux::new(handle.id, net_tx),
            prefabs: RefCell::new(PrefabCache::new()),
            handle,
        }),
        rx,
        net_rx,
        services: HashMap::new(),
        order: Vec::new(),
        next_seq: 0,
        exclusive_count: 0,
        stopping: false,
        last_sweep_ms: monotonic_ms(),
    };
    local.block_on(&runtime, worker.run());
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = self.core.id, "Worker started");
        loop {
            let wait = self.next_wait();
            tokio::select! {
                biased;
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd);
                    let mut handled = 1;
                    while handled < WORKER_BATCH_COUNT_MAX {
                        match self.rx.try_recv() {
                            Ok(cmd) => {
                                self.handle_command(cmd);
                                handled += 1;
                            }
                            Err(_) => break,
                        }
                    }
                }
                msg = self.net_rx.recv() => {
                    if let Some(msg) = msg {
                        self.deliver(msg);
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
            self.pump();
            if self.stopping {
                self.drain();
                break;
            }
        }
        self.teardown();
        info!(worker_id = self.core.id, "Worker stopped");
    }

    /// Deadline for the next sleep: nearest timer, capped by the sweep tick
    fn next_wait(&self) -> Duration {
        let now = monotonic_ms();
        let mut wait = WORKER_IDLE_WAIT_MS_MAX;
        if let Some(due) = self.core.handle.wheel().next_due() {
            wait = wait.min(due.saturating_sub(now));
        }
        let sweep_at = self.last_sweep_ms + SOCKET_SWEEP_INTERVAL_MS;
        wait = wait.min(sweep_at.saturating_sub(now));
        Duration::from_millis(wait)
    }

    /// Fire due timers, then run the periodic sweeps
    fn pump(&mut self) {
        let now = monotonic_ms();
        let mut expired = Vec::new();
        self.core.handle.wheel().update(now, &mut expired);
        for (service, timer_id) in expired {
            // delivered through the queue so timers interleave with messages
            self.core.handle.push_message(Message::new(
                ServiceId::ZERO,
                service,
                0,
                PTYPE_TIMER,
                timer_id.to_string(),
                None,
            ));
        }
        if now.saturating_sub(self.last_sweep_ms) >= SOCKET_SWEEP_INTERVAL_MS {
            self.last_sweep_ms = now;
            self.core.socket.tick(now);
            self.core.prefabs.borrow_mut().sweep();
        }
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Dispatch(msg) => {
                self.core.handle.note_processed();
                self.deliver(msg);
            }
            WorkerCommand::Broadcast(msg) => self.deliver_broadcast(msg),
            WorkerCommand::Spawn(req) => self.spawn_service(req),
            WorkerCommand::Remove {
                id,
                caller,
                session,
            } => self.remove_service(id, caller, session),
            WorkerCommand::Finalize {
                id,
                caller,
                session,
            } => self.finalize_service(id, caller, session),
            WorkerCommand::Scan { caller, session } => self.scan(caller, session),
            WorkerCommand::Wake => {}
            WorkerCommand::Stop => {
                self.stopping = true;
            }
        }
    }

    fn deliver(&mut self, msg: Message) {
        let receiver = msg.receiver();
        let Some(slot) = self.services.get_mut(&receiver.as_u32()) else {
            self.missing_receiver(msg);
            return;
        };
        let ctx = ServiceContext::new(
            receiver,
            slot.name.clone(),
            slot.stats.clone(),
            self.core.clone(),
            self.server.clone(),
        );
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if msg.ptype() == PTYPE_TIMER {
                let timer_id = msg.header().parse().unwrap_or(0);
                slot.handler.on_timer(&ctx, timer_id);
            } else {
                slot.handler.dispatch(&ctx, msg);
            }
        }));
        slot.stats.add_cpu(started.elapsed().as_millis() as u64);
        if outcome.is_err() {
            error!(service_id = %receiver, name = %slot.name, "Handler panicked; removing service");
            if slot.state == ServiceState::Ready {
                slot.state = ServiceState::Exiting;
                self.core.handle.command(WorkerCommand::Finalize {
                    id: receiver,
                    caller: ServiceId::ZERO,
                    session: 0,
                });
            }
        }
    }

    fn deliver_broadcast(&mut self, msg: Message) {
        for id in self.order.clone() {
            if id == msg.sender().as_u32() {
                continue;
            }
            let live = self
                .services
                .get(&id)
                .is_some_and(|slot| slot.state == ServiceState::Ready);
            if live {
                self.deliver(msg.broadcast_copy(ServiceId::from_raw(id)));
            }
        }
    }

    /// Drop the message; report to the sender when a session is attached
    fn missing_receiver(&mut self, msg: Message) {
        debug!(receiver = %msg.receiver(), session = msg.session(), "Message for unknown service dropped");
        let sender = msg.sender();
        let in_range =
            sender.worker_id() >= 1 && sender.worker_id() as usize <= self.server.worker_count();
        if msg.session() > 0 && in_range {
            let _ = self.server.send_message(Message::new(
                msg.receiver(),
                sender,
                -msg.session(),
                PTYPE_ERROR,
                "service not found",
                None,
            ));
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn spawn_service(&mut self, req: SpawnRequest) {
        if self.stopping {
            self.spawn_failed(&req, &Error::ServerStopping);
            return;
        }
        if self.next_seq >= SERVICE_SEQUENCE_COUNT_MAX {
            self.spawn_failed(
                &req,
                &Error::SequenceExhausted {
                    worker_id: self.core.id,
                },
            );
            return;
        }
        let Some(factory) = self.server.factory(&req.kind) else {
            self.spawn_failed(
                &req,
                &Error::UnknownServiceKind {
                    kind: req.kind.clone(),
                },
            );
            return;
        };

        self.next_seq += 1;
        let id = ServiceId::compose(self.core.id, self.next_seq);
        let name: Rc<str> = if req.conf.name.is_empty() {
            Rc::from(req.kind.as_str())
        } else {
            Rc::from(req.conf.name.as_str())
        };
        let stats = ServiceStats::new();
        let mut handler = factory.create();
        let ctx = ServiceContext::new(
            id,
            name.clone(),
            stats.clone(),
            self.core.clone(),
            self.server.clone(),
        );

        let params = req.conf.params.clone();
        let initialised =
            catch_unwind(AssertUnwindSafe(|| handler.init(&ctx, &params))).unwrap_or(false);
        if !initialised {
            self.spawn_failed(
                &req,
                &Error::ServiceInitFailed {
                    kind: req.kind.clone(),
                    reason: "init returned false".into(),
                },
            );
            return;
        }

        if req.conf.unique && !self.server.set_unique_service(&name, id) {
            guard_hook(|| handler.destroy(&ctx));
            self.spawn_failed(
                &req,
                &Error::UniqueNameTaken {
                    name: name.to_string(),
                },
            );
            return;
        }

        self.services.insert(
            id.as_u32(),
            ServiceSlot {
                name: name.clone(),
                unique: req.conf.unique,
                shared: req.conf.shared,
                state: ServiceState::Ready,
                stats,
                handler,
            },
        );
        self.order.push(id.as_u32());
        self.core.handle.service_count.fetch_add(1, Ordering::Relaxed);
        if !req.conf.shared {
            self.exclusive_count += 1;
            self.core.handle.pinned.store(true, Ordering::Relaxed);
        }
        info!(service_id = %id, kind = %req.kind, name = %name, "Service started");

        if let Some(ack) = &req.ack {
            let _ = ack.send(id.as_u32());
        } else if req.session != 0 {
            let _ = self.server.send_message(Message::new(
                id,
                req.creator,
                -req.session,
                PTYPE_SYSTEM,
                "",
                Some(id.as_u32().to_string().as_str().into()),
            ));
        }
    }

    fn spawn_failed(&self, req: &SpawnRequest, error: &Error) {
        warn!(kind = %req.kind, name = %req.conf.name, error = %error, "Service creation failed");
        if let Some(ack) = &req.ack {
            let _ = ack.send(0);
        } else if req.session != 0 {
            let _ = self.server.send_message(Message::new(
                ServiceId::ZERO,
                req.creator,
                -req.session,
                PTYPE_ERROR,
                &error.to_string(),
                None,
            ));
        }
    }

    fn remove_service(&mut self, id: ServiceId, caller: ServiceId, session: i32) {
        match self.services.get_mut(&id.as_u32()) {
            Some(slot) if slot.state == ServiceState::Ready => {
                slot.state = ServiceState::Exiting;
                // queued behind any in-flight messages for this service
                self.core.handle.command(WorkerCommand::Finalize {
                    id,
                    caller,
                    session,
                });
            }
            _ => {
                if session > 0 && !caller.is_zero() {
                    let _ = self.server.send_message(Message::new(
                        ServiceId::ZERO,
                        caller,
                        -session,
                        PTYPE_ERROR,
                        "service not found",
                        None,
                    ));
                }
            }
        }
    }

    fn finalize_service(&mut self, id: ServiceId, caller: ServiceId, session: i32) {
        let Some(mut slot) = self.services.remove(&id.as_u32()) else {
            return;
        };
        self.order.retain(|&entry| entry != id.as_u32());
        let ctx = ServiceContext::new(
            id,
            slot.name.clone(),
            slot.stats.clone(),
            self.core.clone(),
            self.server.clone(),
        );
        guard_hook(|| slot.handler.exit(&ctx));
        guard_hook(|| slot.handler.destroy(&ctx));
        if slot.unique {
            self.server.release_unique(&slot.name, id);
        }
        self.core.handle.service_count.fetch_sub(1, Ordering::Relaxed);
        if !slot.shared {
            self.exclusive_count -= 1;
            if self.exclusive_count == 0 {
                self.core.handle.pinned.store(false, Ordering::Relaxed);
            }
        }
        info!(service_id = %id, name = %slot.name, "Service destroyed");

        if session != 0 && !caller.is_zero() {
            let _ = self.server.send_message(Message::new(
                ServiceId::ZERO,
                caller,
                -session,
                PTYPE_SYSTEM,
                "",
                Some(id.as_u32().to_string().as_str().into()),
            ));
        }
    }

    fn scan(&mut self, caller: ServiceId, session: i32) {
        let listing: Vec<serde_json::Value> = self
            .order
            .iter()
            .filter_map(|id| {
                self.services.get(id).map(|slot| {
                    serde_json::json!({
                        "id": id,
                        "name": &*slot.name,
                        "unique": slot.unique,
                        "cpu_ms": slot.stats.cpu_cost_ms(),
                    })
                })
            })
            .collect();
        let body = serde_json::Value::Array(listing).to_string();
        let _ = self.server.send_message(Message::new(
            ServiceId::ZERO,
            caller,
            -session,
            PTYPE_SYSTEM,
            "",
            Some(body.as_str().into()),
        ));
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// The queue is drain-only now: process what is left, reject spawns
    fn drain(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle_command(cmd);
        }
        while let Ok(msg) = self.net_rx.try_recv() {
            self.deliver(msg);
        }
    }

    fn teardown(&mut self) {
        for id in std::mem::take(&mut self.order).into_iter().rev() {
            self.finalize_service(ServiceId::from_raw(id), ServiceId::ZERO, 0);
        }
        self.core.socket.close_all();
        debug_assert!(self.services.is_empty());
    }
}

fn guard_hook(hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        error!("Service lifecycle hook panicked");
    }
}
