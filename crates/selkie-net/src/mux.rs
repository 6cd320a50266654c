//! The socket multiplexer
//!
//! TigerStyle: multiplexer-local handles, never raw OS descriptors.
//!
//! Handles (`fd`) index into the multiplexer's own tables. Acceptors and
//! connections live in separate tables; both are `Rc`/`RefCell` state
//! because the multiplexer is driven by exactly one thread.
//!
//! Completion addressing convention: socket messages carry the connection
//! fd in the message *sender* slot. Accept and connect completions use the
//! message type registered with `listen`/`connect`; data, close and error
//! completions use the fixed socket tags.

use crate::connection::{monotonic_ms, ConnCmd, ConnectionTask};
use selkie_core::constants::{
    CONNECT_PROBE_TIMEOUT_MS, SEND_QUEUE_ERROR_BYTES_DEFAULT, SEND_QUEUE_WARN_BYTES_DEFAULT,
    SOCKET_CHUNK_SIZE_BYTES,
};
use selkie_core::message::{PTYPE_SOCKET_CLOSE, PTYPE_SOCKET_ERROR};
use selkie_core::{Buffer, Message, ServiceId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::spawn_local;
use tracing::{debug, error, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Flags accepted by [`SocketMux::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlag {
    None,
    /// Close the connection once this payload has drained
    CloseAfterSend,
    /// Split the payload into independent segments without framing
    Chunked,
}

/// State shared between the multiplexer table and a connection task
pub(crate) struct ConnShared {
    pub state: Cell<ConnState>,
    pub address: RefCell<String>,
    pub stream: RefCell<Option<Rc<TcpStream>>>,
    pub queue_bytes: Cell<usize>,
    pub warn_bytes: Cell<usize>,
    pub error_bytes: Cell<usize>,
    pub warn_latched: Cell<bool>,
    pub error_latched: Cell<bool>,
    pub last_recv_ms: Cell<u64>,
    pub timeout_secs: Cell<u64>,
    pub write_chunked: Cell<bool>,
}

impl ConnShared {
    fn new(state: ConnState, address: String) -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(state),
            address: RefCell::new(address),
            stream: RefCell::new(None),
            queue_bytes: Cell::new(0),
            warn_bytes: Cell::new(SEND_QUEUE_WARN_BYTES_DEFAULT),
            error_bytes: Cell::new(SEND_QUEUE_ERROR_BYTES_DEFAULT),
            warn_latched: Cell::new(false),
            error_latched: Cell::new(false),
            last_recv_ms: Cell::new(monotonic_ms()),
            timeout_secs: Cell::new(0),
            write_chunked: Cell::new(false),
        })
    }
}

pub(crate) struct ConnHandle {
    pub owner: ServiceId,
    pub cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    pub shared: Rc<ConnShared>,
}

struct AcceptorEntry {
    listener: Rc<TcpListener>,
    owner: ServiceId,
    ptype: u8,
    address: String,
    shutdown: Rc<Notify>,
}

pub(crate) struct MuxState {
    worker_id: u32,
    sink: mpsc::UnboundedSender<Message>,
    next_fd: Cell<u32>,
    pub(crate) conns: RefCell<HashMap<u32, ConnHandle>>,
    acceptors: RefCell<HashMap<u32, AcceptorEntry>>,
}

impl MuxState {
    fn alloc_fd(&self) -> u32 {
        // 0 is the failure sentinel, never a valid handle
        let fd = self.next_fd.get().wrapping_add(1).max(1);
        self.next_fd.set(fd);
        fd
    }

    pub(crate) fn post(&self, msg: Message) {
        let _ = self.sink.send(msg);
    }
}

/// Per-worker socket multiplexer
pub struct SocketMux {
    state: Rc<MuxState>,
}

impl SocketMux {
    /// Create a multiplexer posting completions into `sink`
    pub fn new(worker_id: u32, sink: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            state: Rc::new(MuxState {
                worker_id,
                sink,
                next_fd: Cell::new(0),
                conns: RefCell::new(HashMap::new()),
                acceptors: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Synchronous reachability probe
    pub fn try_open(&self, host: &str, port: u16) -> bool {
        let Some(addr) = resolve(host, port) else {
            return false;
        };
        std::net::TcpStream::connect_timeout(
            &addr,
            Duration::from_millis(CONNECT_PROBE_TIMEOUT_MS),
        )
        .is_ok()
    }

    /// Create an acceptor; returns its handle, or 0 on failure
    pub fn listen(&self, host: &str, port: u16, owner: ServiceId, ptype: u8) -> u32 {
        let bound = std::net::TcpListener::bind((host, port)).and_then(|l| {
            l.set_nonblocking(true)?;
            TcpListener::from_std(l)
        });
        let listener = match bound {
            Ok(l) => l,
            Err(e) => {
                error!(worker_id = self.state.worker_id, host, port, error = %e, "Listen failed");
                return 0;
            }
        };
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let fd = self.state.alloc_fd();
        self.state.acceptors.borrow_mut().insert(
            fd,
            AcceptorEntry {
                listener: Rc::new(listener),
                owner,
                ptype,
                address: address.clone(),
                shutdown: Rc::new(Notify::new()),
            },
        );
        debug!(worker_id = self.state.worker_id, fd, address = %address, "Acceptor created");
        fd
    }

    /// Arm one acceptance on acceptor `fd`
    ///
    /// The accepted connection is owned by `owner` (the acceptor's owner
    /// when `owner` is zero) and reports data with the acceptor's type.
    pub fn accept(&self, fd: u32, session: i32, owner: ServiceId) {
        let (listener, ptype, owner, shutdown) = {
            let acceptors = self.state.acceptors.borrow();
            let Some(entry) = acceptors.get(&fd) else {
                self.state.post(error_message(fd, owner, session, "acceptor not found"));
                return;
            };
            let owner = if owner.is_zero() { entry.owner } else { owner };
            (entry.listener.clone(), entry.ptype, owner, entry.shutdown.clone())
        };

        let state = self.state.clone();
        spawn_local(async move {
            tokio::select! {
                _ = shutdown.notified() => {
                    state.post(close_message(fd, owner, session, "closed"));
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let new_fd = install_connection(&state, stream, owner, peer.to_string());
                        let msg = Message::new(
                            ServiceId::from_raw(new_fd),
                            owner,
                            session,
                            ptype,
                            new_fd.to_string(),
                            Some(Buffer::from(peer.to_string().as_str())),
                        );
                        state.post(msg);
                    }
                    Err(e) => {
                        state.post(error_message(fd, owner, session, &e.to_string()));
                    }
                },
            }
        });
    }

    /// Open a connection
    ///
    /// With `session == 0` the call is synchronous and returns the handle
    /// (or 0). Otherwise the handle is returned immediately and the
    /// completion arrives on `session`. `timeout_ms == 0` means no timeout.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        owner: ServiceId,
        ptype: u8,
        session: i32,
        timeout_ms: u32,
    ) -> u32 {
        if session == 0 {
            return self.connect_sync(host, port, owner, timeout_ms);
        }

        let fd = self.state.alloc_fd();
        let shared = ConnShared::new(ConnState::Connecting, format!("{}:{}", host, port));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.state.conns.borrow_mut().insert(
            fd,
            ConnHandle {
                owner,
                cmd_tx,
                shared: shared.clone(),
            },
        );

        let state = self.state.clone();
        let target = format!("{}:{}", host, port);
        spawn_local(async move {
            let mut cmd_rx = cmd_rx;
            let mut pending_cmds = Vec::new();
            let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64));
            let outcome =
                connect_with_cmds(&target, timeout, &mut cmd_rx, &mut pending_cmds).await;

            match outcome {
                ConnectOutcome::Cancelled => {
                    state.conns.borrow_mut().remove(&fd);
                    shared.state.set(ConnState::Closed);
                    state.post(close_message(fd, owner, session, "closed"));
                }
                ConnectOutcome::Failed(reason) => {
                    state.conns.borrow_mut().remove(&fd);
                    shared.state.set(ConnState::Closed);
                    state.post(error_message(fd, owner, session, &reason));
                }
                ConnectOutcome::Connected(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or(target);
                    *shared.address.borrow_mut() = peer.clone();
                    shared.state.set(ConnState::Open);
                    state.post(Message::new(
                        ServiceId::from_raw(fd),
                        owner,
                        session,
                        ptype,
                        fd.to_string(),
                        Some(Buffer::from(peer.as_str())),
                    ));
                    ConnectionTask::spawn_open(
                        state.clone(),
                        fd,
                        owner,
                        stream,
                        cmd_rx,
                        pending_cmds,
                        shared,
                    );
                }
            }
        });

        fd
    }

    fn connect_sync(&self, host: &str, port: u16, owner: ServiceId, timeout_ms: u32) -> u32 {
        let Some(addr) = resolve(host, port) else {
            error!(host, port, "Connect failed: address did not resolve");
            return 0;
        };
        let connected = if timeout_ms > 0 {
            std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms as u64))
        } else {
            std::net::TcpStream::connect(addr)
        };
        let stream = match connected.and_then(|s| {
            s.set_nonblocking(true)?;
            TcpStream::from_std(s)
        }) {
            Ok(s) => s,
            Err(e) => {
                error!(host, port, error = %e, "Connect failed");
                return 0;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("{}:{}", host, port));
        install_connection(&self.state, stream, owner, peer)
    }

    /// Arm one read
    ///
    /// `count > 0` reads exactly `count` bytes; `count == 0` with a
    /// delimiter reads up to (and consumes) the delimiter; `count == 0`
    /// with no delimiter delivers whatever arrives next.
    pub fn read(&self, fd: u32, owner: ServiceId, count: usize, delim: &[u8], session: i32) {
        let conns = self.state.conns.borrow();
        let Some(conn) = conns.get(&fd) else {
            drop(conns);
            self.state.post(error_message(fd, owner, session, "socket not found"));
            return;
        };
        let cmd = ConnCmd::Read {
            count,
            delim: delim.to_vec(),
            session,
        };
        if conn.cmd_tx.send(cmd).is_err() {
            let owner = conn.owner;
            drop(conns);
            self.state.post(error_message(fd, owner, session, "socket closed"));
        }
    }

    /// Queue a payload for sending
    ///
    /// Returns false when the connection is unknown, no longer writable, or
    /// its send queue is past the hard limit.
    pub fn write(&self, fd: u32, data: Arc<Buffer>, flag: WriteFlag) -> bool {
        let conns = self.state.conns.borrow();
        let Some(conn) = conns.get(&fd) else {
            return false;
        };
        let shared = &conn.shared;
        match shared.state.get() {
            ConnState::Connecting | ConnState::Open => {}
            _ => return false,
        }
        let len = data.len();
        if len == 0 {
            return true;
        }

        let queued = shared.queue_bytes.get();
        let error_bytes = shared.error_bytes.get();
        if error_bytes > 0 && queued + len > error_bytes {
            if !shared.error_latched.replace(true) {
                error!(fd, queued, limit = error_bytes, "Send queue past hard limit, rejecting writes");
                let owner = conn.owner;
                let msg = error_message(fd, owner, 0, "send queue overflow");
                drop(conns);
                self.state.post(msg);
            }
            return false;
        }
        let warn_bytes = shared.warn_bytes.get();
        if warn_bytes > 0 && queued + len > warn_bytes && !shared.warn_latched.replace(true) {
            warn!(fd, queued, limit = warn_bytes, "Send queue past warn limit");
        }
        shared.queue_bytes.set(queued + len);

        let close_after = flag == WriteFlag::CloseAfterSend;
        if close_after {
            shared.state.set(ConnState::Closing);
        }
        let chunked = flag == WriteFlag::Chunked || shared.write_chunked.get();
        if chunked && len > SOCKET_CHUNK_SIZE_BYTES {
            let bytes = data.data();
            let mut sent = true;
            let mut chunks = bytes.chunks(SOCKET_CHUNK_SIZE_BYTES).peekable();
            while let Some(chunk) = chunks.next() {
                let last = chunks.peek().is_none();
                sent &= conn
                    .cmd_tx
                    .send(ConnCmd::Write {
                        data: Arc::new(Buffer::from(chunk)),
                        close_after: close_after && last,
                    })
                    .is_ok();
            }
            sent
        } else {
            conn.cmd_tx
                .send(ConnCmd::Write { data, close_after })
                .is_ok()
        }
    }

    /// Close a connection or an acceptor
    ///
    /// A forced close does not drain pending writes; in-flight reads and
    /// accepts complete with a terminal close message.
    pub fn close(&self, fd: u32) -> bool {
        if let Some(conn) = self.state.conns.borrow().get(&fd) {
            conn.shared.state.set(ConnState::Closing);
            return conn
                .cmd_tx
                .send(ConnCmd::Close { reason: "closed" })
                .is_ok();
        }
        if let Some(acceptor) = self.state.acceptors.borrow_mut().remove(&fd) {
            acceptor.shutdown.notify_waiters();
            debug!(fd, address = %acceptor.address, "Acceptor closed");
            return true;
        }
        false
    }

    /// Set the idle timeout; 0 disables the sweep for this connection
    pub fn settimeout(&self, fd: u32, seconds: u64) -> bool {
        self.with_conn(fd, |conn| conn.shared.timeout_secs.set(seconds))
    }

    /// Disable Nagle's algorithm; only possible once the stream is open
    pub fn setnodelay(&self, fd: u32) -> bool {
        let conns = self.state.conns.borrow();
        let Some(conn) = conns.get(&fd) else {
            return false;
        };
        let result = match conn.shared.stream.borrow().as_ref() {
            Some(stream) => stream.set_nodelay(true).is_ok(),
            None => false,
        };
        result
    }

    /// Enable chunked transfer: `"r"` read side, `"w"` write side, or both
    pub fn set_enable_chunked(&self, fd: u32, mode: &str) -> bool {
        let (read, write) = match mode {
            "r" => (true, false),
            "w" => (false, true),
            "wr" | "rw" => (true, true),
            _ => return false,
        };
        self.with_conn(fd, |conn| {
            conn.shared.write_chunked.set(write);
            let _ = conn.cmd_tx.send(ConnCmd::SetReadChunked(read));
        })
    }

    /// Set the send-queue thresholds in bytes; 0 disables a threshold
    pub fn set_send_queue_limit(&self, fd: u32, warn: usize, error: usize) -> bool {
        self.with_conn(fd, |conn| {
            conn.shared.warn_bytes.set(warn);
            conn.shared.error_bytes.set(error);
        })
    }

    /// Remote address of a connection, or the local address of an acceptor
    pub fn getaddress(&self, fd: u32) -> String {
        if let Some(conn) = self.state.conns.borrow().get(&fd) {
            return conn.shared.address.borrow().clone();
        }
        self.state
            .acceptors
            .borrow()
            .get(&fd)
            .map(|a| a.address.clone())
            .unwrap_or_default()
    }

    /// Once-per-second sweep closing idle connections
    pub fn tick(&self, now_ms: u64) {
        let conns = self.state.conns.borrow();
        for (fd, conn) in conns.iter() {
            let timeout_secs = conn.shared.timeout_secs.get();
            if timeout_secs == 0 || conn.shared.state.get() != ConnState::Open {
                continue;
            }
            let idle_ms = now_ms.saturating_sub(conn.shared.last_recv_ms.get());
            if idle_ms >= timeout_secs * 1000 {
                debug!(fd, idle_ms, "Closing idle connection");
                conn.shared.state.set(ConnState::Closing);
                let _ = conn.cmd_tx.send(ConnCmd::Close { reason: "timeout" });
            }
        }
    }

    /// Cancel every outstanding operation and close every socket
    pub fn close_all(&self) {
        for (_, acceptor) in self.state.acceptors.borrow_mut().drain() {
            acceptor.shutdown.notify_waiters();
        }
        let conns = self.state.conns.borrow();
        for conn in conns.values() {
            conn.shared.state.set(ConnState::Closing);
            let _ = conn.cmd_tx.send(ConnCmd::Close { reason: "closed" });
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.state.conns.borrow().len()
    }

    fn with_conn(&self, fd: u32, apply: impl FnOnce(&ConnHandle)) -> bool {
        match self.state.conns.borrow().get(&fd) {
            Some(conn) => {
                apply(conn);
                true
            }
            None => false,
        }
    }
}

/// Register an open stream and spawn its task; returns the new handle
pub(crate) fn install_connection(
    state: &Rc<MuxState>,
    stream: TcpStream,
    owner: ServiceId,
    address: String,
) -> u32 {
    let fd = state.alloc_fd();
    let shared = ConnShared::new(ConnState::Open, address);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    state.conns.borrow_mut().insert(
        fd,
        ConnHandle {
            owner,
            cmd_tx,
            shared: shared.clone(),
        },
    );
    ConnectionTask::spawn_open(state.clone(), fd, owner, stream, cmd_rx, Vec::new(), shared);
    fd
}

pub(crate) fn close_message(fd: u32, owner: ServiceId, session: i32, reason: &str) -> Message {
    Message::new(
        ServiceId::from_raw(fd),
        owner,
        session,
        PTYPE_SOCKET_CLOSE,
        reason,
        None,
    )
}

pub(crate) fn error_message(fd: u32, owner: ServiceId, session: i32, reason: &str) -> Message {
    Message::new(
        ServiceId::from_raw(fd),
        owner,
        session,
        PTYPE_SOCKET_ERROR,
        reason,
        None,
    )
}

fn resolve(host: &str, port: u16) -> Option<std::net::SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

enum ConnectOutcome {
    Connected(TcpStream),
    Failed(String),
    Cancelled,
}

/// Await a connect attempt while buffering commands that arrive early
///
/// A `Close` command cancels the attempt; everything else is replayed once
/// the connection opens.
async fn connect_with_cmds(
    target: &str,
    timeout: Option<Duration>,
    cmd_rx: &mut mpsc::UnboundedReceiver<ConnCmd>,
    pending: &mut Vec<ConnCmd>,
) -> ConnectOutcome {
    let connect = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(target)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            },
            None => TcpStream::connect(target).await,
        }
    };
    tokio::pin!(connect);
    loop {
        tokio::select! {
            outcome = &mut connect => {
                return match outcome {
                    Ok(stream) => ConnectOutcome::Connected(stream),
                    Err(e) => ConnectOutcome::Failed(e.to_string()),
                };
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Close { .. }) | None => return ConnectOutcome::Cancelled,
                Some(other) => pending.push(other),
            },
        }
    }
}
