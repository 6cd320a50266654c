//! Service capability interface and handler context
//!
//! TigerStyle: a small fixed interface; the five hooks are the entire
//! vocabulary between the runtime and a handler.
//!
//! Handlers are constructed by a [`ServiceFactory`] registered under a kind
//! name, always on the owning worker's thread, and never leave it; a
//! handler therefore needs no internal synchronisation. `dispatch` is the
//! hot path and must not block: a handler runs to completion before the
//! worker picks the next message.

use crate::server::Server;
use crate::worker::{ServiceStats, WorkerCore};
use selkie_core::message::PTYPE_UNKNOWN;
use selkie_core::{Buffer, Error, Message, Result, ServiceId};
use selkie_net::SocketMux;
use std::rc::Rc;
use std::sync::Arc;

/// The handler behind a service
///
/// All hooks run on the owning worker's thread; invocations for one
/// service are strictly serialised.
pub trait Service {
    /// Called once after allocation. Returning false aborts the creation
    /// and reports a failure to the creator.
    fn init(&mut self, ctx: &ServiceContext, params: &str) -> bool;

    /// Handle one message. The only hot path; must not block.
    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message);

    /// A timer armed through [`ServiceContext::timeout`] expired.
    fn on_timer(&mut self, ctx: &ServiceContext, timer_id: u32) {
        let _ = (ctx, timer_id);
    }

    /// The service is being removed; in-flight messages were drained.
    fn exit(&mut self, ctx: &ServiceContext) {
        let _ = ctx;
    }

    /// Last hook before the record is dropped.
    fn destroy(&mut self, ctx: &ServiceContext) {
        let _ = ctx;
    }
}

/// Builds handler instances for one registered service kind
pub trait ServiceFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Service>;
}

impl<F> ServiceFactory for F
where
    F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn Service> {
        self()
    }
}

/// Creation parameters for one service
#[derive(Debug, Clone)]
pub struct ServiceConf {
    /// Service name; registered globally when `unique` is set
    pub name: String,
    /// At most one service per name across the server
    pub unique: bool,
    /// When false the chosen worker becomes single-tenant
    pub shared: bool,
    /// Explicit 1-based worker placement; 0 lets the server choose
    pub worker_hint: u32,
    /// Free-form parameters for the init hook
    pub params: String,
}

impl Default for ServiceConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            unique: false,
            shared: true,
            worker_hint: 0,
            params: String::new(),
        }
    }
}

/// Capabilities handed to every hook invocation
///
/// Cheap to construct: a couple of reference-count bumps. The context is
/// only valid on the owning worker's thread and is rebuilt per invocation.
pub struct ServiceContext {
    id: ServiceId,
    name: Rc<str>,
    stats: Rc<ServiceStats>,
    core: Rc<WorkerCore>,
    server: Arc<Server>,
}

impl ServiceContext {
    pub(crate) fn new(
        id: ServiceId,
        name: Rc<str>,
        stats: Rc<ServiceStats>,
        core: Rc<WorkerCore>,
        server: Arc<Server>,
    ) -> Self {
        debug_assert!(!id.is_zero());
        debug_assert!(id.worker_id() == core.id);
        Self {
            id,
            name,
            stats,
            core,
            server,
        }
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> u32 {
        self.core.id
    }

    /// Accumulated wall-clock cost of this service's handler invocations, ms
    pub fn cpu_cost(&self) -> u64 {
        self.stats.cpu_cost_ms()
    }

    /// The router
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// This worker's socket multiplexer
    pub fn socket(&self) -> &SocketMux {
        &self.core.socket
    }

    /// Emit one log line tagged with this service's id
    pub fn log(&self, level: tracing::Level, message: &str) {
        match level {
            tracing::Level::ERROR => tracing::error!(service_id = %self.id, "{}", message),
            tracing::Level::WARN => tracing::warn!(service_id = %self.id, "{}", message),
            tracing::Level::INFO => tracing::info!(service_id = %self.id, "{}", message),
            _ => tracing::debug!(service_id = %self.id, "{}", message),
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a message on behalf of this service
    pub fn send(
        &self,
        receiver: ServiceId,
        payload: Option<Buffer>,
        header: &str,
        session: i32,
        ptype: u8,
    ) -> Result<()> {
        if ptype == PTYPE_UNKNOWN {
            return Err(Error::InvalidMessageType { ptype });
        }
        self.server.send_message(Message::new(
            self.id, receiver, session, ptype, header, payload,
        ))
    }

    /// Fan a payload out to every live service except this one
    pub fn broadcast(&self, payload: Buffer, ptype: u8) -> Result<()> {
        self.server.broadcast(self.id, payload, ptype)
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Arm a one-shot timer; the handle comes back through `on_timer`
    pub fn timeout(&self, delay_ms: u64) -> u32 {
        self.core.handle.schedule_timer(self.id, delay_ms)
    }

    /// Lazily cancel a timer; an already-fired handle is a no-op
    pub fn remove_timer(&self, timer_id: u32) {
        self.core.handle.cancel_timer(timer_id);
    }

    // =========================================================================
    // Prefabs
    // =========================================================================

    /// Intern a payload on this worker for zero-copy fan-out
    pub fn make_prefab(&self, buffer: Buffer) -> u64 {
        self.core.prefabs.borrow_mut().intern(buffer)
    }

    /// Send an interned payload without copying it
    ///
    /// Fails when the id is unknown on this worker; prefabs never resolve
    /// across workers.
    pub fn send_prefab(
        &self,
        receiver: ServiceId,
        prefab_id: u64,
        header: &str,
        session: i32,
        ptype: u8,
    ) -> Result<()> {
        if ptype == PTYPE_UNKNOWN {
            return Err(Error::InvalidMessageType { ptype });
        }
        let payload = self
            .core
            .prefabs
            .borrow_mut()
            .get(prefab_id)
            .ok_or(Error::PrefabNotFound { id: prefab_id })?;
        self.server.send_message(Message::with_shared_payload(
            self.id, receiver, session, ptype, header, payload,
        ))
    }

    // =========================================================================
    // Lifecycle and administration
    // =========================================================================

    /// Create a service; the ack or error arrives on `session`
    pub fn new_service(&self, kind: &str, conf: ServiceConf, session: i32) -> Result<()> {
        self.server.new_service(kind, conf, self.id, session)?;
        Ok(())
    }

    /// Remove a service (this one included); the ack arrives on `session`
    pub fn kill(&self, id: ServiceId, session: i32) -> Result<()> {
        self.server.remove_service(id, self.id, session)
    }

    /// Resolve a unique service name; zero when unknown
    pub fn query_service(&self, name: &str) -> ServiceId {
        self.server.get_unique_service(name)
    }

    /// Ask a worker for its service listing, answered on `session`
    pub fn scan_services(&self, worker_id: u32, session: i32) -> Result<()> {
        self.server.scan_services(self.id, worker_id, session)
    }

    /// Run an administrative command, answered on `session`
    pub fn runcmd(&self, command: &str, session: i32) {
        self.server.runcmd(self.id, command, session);
    }

    pub fn set_env(&self, key: &str, value: &str) {
        self.server.set_env(key, value);
    }

    pub fn get_env(&self, key: &str) -> Option<String> {
        self.server.get_env(key)
    }

    /// JSON snapshot of server and worker state
    pub fn server_info(&self) -> String {
        self.server.info()
    }

    /// Begin server shutdown with the given exit code
    pub fn exit(&self, code: i32) {
        self.server.stop(code);
    }

    /// Cached wall clock in milliseconds, adjusted by `adjtime`
    pub fn now(&self) -> i64 {
        self.server.now()
    }

    /// Shift the server clock forward; returns whether it was applied
    pub fn adjtime(&self, offset_ms: i64) -> bool {
        self.server.adjtime(offset_ms)
    }

    /// Total number of live services
    pub fn service_count(&self) -> usize {
        self.server.service_count()
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.server.worker_count()
    }
}
