//! Per-connection task
//!
//! Each connection is driven by one task on the owning worker's `LocalSet`.
//! The task owns the read buffer and the send queue; the multiplexer talks
//! to it over an unbounded command channel, so a stalled peer never blocks
//! a service handler. Reads and writes use readiness loops on a shared
//! `TcpStream`, which keeps the stream reachable for `setnodelay` without
//! splitting it.

use crate::mux::{close_message, error_message, ConnShared, ConnState, MuxState};
use bytes::BytesMut;
use selkie_core::message::PTYPE_SOCKET_DATA;
use selkie_core::{Buffer, Message, ServiceId};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::spawn_local;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since process start, monotonic
pub(crate) fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Commands a multiplexer sends to a connection task
pub(crate) enum ConnCmd {
    Read {
        count: usize,
        delim: Vec<u8>,
        session: i32,
    },
    Write {
        data: Arc<Buffer>,
        close_after: bool,
    },
    SetReadChunked(bool),
    /// Forced close: pending writes are dropped, in-flight reads complete
    /// with a terminal close message
    Close { reason: &'static str },
}

struct PendingRead {
    count: usize,
    delim: Vec<u8>,
    session: i32,
}

struct WriteItem {
    data: Arc<Buffer>,
    offset: usize,
}

pub(crate) struct ConnectionTask {
    fd: u32,
    owner: ServiceId,
    stream: Rc<TcpStream>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    shared: Rc<ConnShared>,
    state: Rc<MuxState>,
    buf: BytesMut,
    pending: Option<PendingRead>,
    read_chunked: bool,
    write_q: VecDeque<WriteItem>,
    close_after_drain: bool,
}

enum FillOutcome {
    Bytes,
    Eof,
    WouldBlock,
}

impl ConnectionTask {
    /// Spawn the task for an already-open stream
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn_open(
        state: Rc<MuxState>,
        fd: u32,
        owner: ServiceId,
        stream: TcpStream,
        cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
        replay: Vec<ConnCmd>,
        shared: Rc<ConnShared>,
    ) {
        let stream = Rc::new(stream);
        *shared.stream.borrow_mut() = Some(stream.clone());
        let task = Self {
            fd,
            owner,
            stream,
            cmd_rx,
            shared,
            state,
            buf: BytesMut::with_capacity(8 * 1024),
            pending: None,
            read_chunked: false,
            write_q: VecDeque::new(),
            close_after_drain: false,
        };
        spawn_local(task.run(replay));
    }

    async fn run(mut self, replay: Vec<ConnCmd>) {
        let mut done = false;
        for cmd in replay {
            if self.on_cmd(cmd) {
                done = true;
                break;
            }
        }

        while !done {
            let want_read = self.pending.is_some() || self.read_chunked;
            let want_write = !self.write_q.is_empty();
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    done = match cmd {
                        Some(cmd) => self.on_cmd(cmd),
                        None => true,
                    };
                }
                ready = self.stream.writable(), if want_write => {
                    done = match ready {
                        Ok(()) => self.on_writable(),
                        Err(e) => {
                            self.fail(&e);
                            true
                        }
                    };
                }
                ready = self.stream.readable(), if want_read => {
                    done = match ready {
                        Ok(()) => self.on_readable(),
                        Err(e) => {
                            self.fail(&e);
                            true
                        }
                    };
                }
            }
        }

        self.deregister();
    }

    /// Returns true when the connection is finished
    fn on_cmd(&mut self, cmd: ConnCmd) -> bool {
        match cmd {
            ConnCmd::Read {
                count,
                delim,
                session,
            } => {
                if self.read_chunked {
                    self.state
                        .post(error_message(self.fd, self.owner, session, "read-chunked mode active"));
                } else if self.pending.is_some() {
                    self.state
                        .post(error_message(self.fd, self.owner, session, "read already pending"));
                } else {
                    self.pending = Some(PendingRead {
                        count,
                        delim,
                        session,
                    });
                    self.deliver();
                }
                false
            }
            ConnCmd::Write { data, close_after } => {
                self.close_after_drain |= close_after;
                self.write_q.push_back(WriteItem { data, offset: 0 });
                if let Err(e) = self.flush() {
                    self.fail(&e);
                    return true;
                }
                if self.write_q.is_empty() && self.close_after_drain {
                    self.finish_close("closed");
                    return true;
                }
                false
            }
            ConnCmd::SetReadChunked(enabled) => {
                self.read_chunked = enabled;
                if enabled {
                    self.pending = None;
                    self.deliver();
                }
                false
            }
            ConnCmd::Close { reason } => {
                let session = self.pending.take().map(|p| p.session).unwrap_or(0);
                self.state
                    .post(close_message(self.fd, self.owner, session, reason));
                true
            }
        }
    }

    fn on_writable(&mut self) -> bool {
        if let Err(e) = self.flush() {
            self.fail(&e);
            return true;
        }
        if self.write_q.is_empty() && self.close_after_drain {
            self.finish_close("closed");
            return true;
        }
        false
    }

    fn on_readable(&mut self) -> bool {
        match self.fill() {
            Ok(FillOutcome::Bytes) => {
                self.shared.last_recv_ms.set(monotonic_ms());
                self.deliver();
                false
            }
            Ok(FillOutcome::WouldBlock) => false,
            Ok(FillOutcome::Eof) => {
                let session = self.pending.take().map(|p| p.session).unwrap_or(0);
                self.state
                    .post(close_message(self.fd, self.owner, session, "eof"));
                true
            }
            Err(e) => {
                self.fail(&e);
                true
            }
        }
    }

    fn fill(&mut self) -> io::Result<FillOutcome> {
        match self.stream.try_read_buf(&mut self.buf) {
            Ok(0) => Ok(FillOutcome::Eof),
            Ok(_) => Ok(FillOutcome::Bytes),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(FillOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Complete the armed read (or stream a chunk) from buffered bytes
    fn deliver(&mut self) {
        if self.read_chunked {
            if !self.buf.is_empty() {
                let chunk = self.buf.split();
                self.post_data(0, &chunk);
            }
            return;
        }
        let Some(pending) = &self.pending else {
            return;
        };
        if pending.count > 0 {
            if self.buf.len() >= pending.count {
                let count = pending.count;
                let session = pending.session;
                let chunk = self.buf.split_to(count);
                self.pending = None;
                self.post_data(session, &chunk);
            }
        } else if !pending.delim.is_empty() {
            if let Some(pos) = find(&self.buf, &pending.delim) {
                let delim_len = pending.delim.len();
                let session = pending.session;
                let chunk = self.buf.split_to(pos);
                let _ = self.buf.split_to(delim_len);
                self.pending = None;
                self.post_data(session, &chunk);
            }
        } else if !self.buf.is_empty() {
            let session = pending.session;
            let chunk = self.buf.split();
            self.pending = None;
            self.post_data(session, &chunk);
        }
    }

    fn post_data(&self, session: i32, bytes: &[u8]) {
        self.state.post(Message::new(
            ServiceId::from_raw(self.fd),
            self.owner,
            session,
            PTYPE_SOCKET_DATA,
            "",
            Some(Buffer::from(bytes)),
        ));
    }

    fn flush(&mut self) -> io::Result<()> {
        while let Some(item) = self.write_q.front_mut() {
            let bytes = &item.data.data()[item.offset..];
            match self.stream.try_write(bytes) {
                Ok(n) => {
                    item.offset += n;
                    let queued = self.shared.queue_bytes.get().saturating_sub(n);
                    self.shared.queue_bytes.set(queued);
                    let warn = self.shared.warn_bytes.get();
                    if warn == 0 || queued < warn {
                        // drained below the warn threshold: the latches reset
                        self.shared.warn_latched.set(false);
                        self.shared.error_latched.set(false);
                    }
                    if item.offset == item.data.len() {
                        self.write_q.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn finish_close(&mut self, reason: &str) {
        let session = self.pending.take().map(|p| p.session).unwrap_or(0);
        self.state
            .post(close_message(self.fd, self.owner, session, reason));
    }

    fn fail(&mut self, error: &io::Error) {
        let session = self.pending.take().map(|p| p.session).unwrap_or(0);
        self.state
            .post(error_message(self.fd, self.owner, session, &error.to_string()));
    }

    fn deregister(&mut self) {
        // pending writes that never drained still count as released
        self.shared.queue_bytes.set(0);
        self.shared.state.set(ConnState::Closed);
        *self.shared.stream.borrow_mut() = None;
        self.state.conns.borrow_mut().remove(&self.fd);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    debug_assert!(!needle.is_empty());
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find(b"hello\r\nworld", b"\r\n"), Some(5));
        assert_eq!(find(b"hello", b"\r\n"), None);
        assert_eq!(find(b"\n", b"\n"), Some(0));
        assert_eq!(find(b"", b"\n"), None);
    }

    #[test]
    fn test_monotonic_ms_advances() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_ms();
        assert!(b >= a + 1);
    }
}
