//! Multiplexer scenarios over real loopback sockets
//!
//! Each test drives a `SocketMux` on a current-thread runtime with a
//! `LocalSet`, mirroring how a worker hosts one, and asserts on the
//! completion messages that land in the sink channel.

use selkie_core::message::{
    PTYPE_SOCKET_ACCEPT, PTYPE_SOCKET_CLOSE, PTYPE_SOCKET_DATA, PTYPE_SOCKET_ERROR,
};
use selkie_core::{Buffer, Message, ServiceId};
use selkie_net::{SocketMux, WriteFlag};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn owner() -> ServiceId {
    ServiceId::compose(1, 1)
}

fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, future)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no completion arrived")
        .expect("sink closed")
}

struct Harness {
    mux: SocketMux,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            mux: SocketMux::new(1, tx),
            rx,
        }
    }

    fn listen(&self) -> (u32, u16) {
        let fd = self.mux.listen("127.0.0.1", 0, owner(), PTYPE_SOCKET_ACCEPT);
        assert!(fd != 0);
        let address = self.mux.getaddress(fd);
        let port = address.rsplit(':').next().unwrap().parse().unwrap();
        (fd, port)
    }

    /// One accepted + one connected fd, fully established
    async fn pair(&mut self) -> (u32, u32) {
        let (lfd, port) = self.listen();
        self.mux.accept(lfd, 100, owner());
        let client = self
            .mux
            .connect("127.0.0.1", port, owner(), PTYPE_SOCKET_ACCEPT, 200, 1000);
        assert!(client != 0);
        let first = next(&mut self.rx).await;
        let second = next(&mut self.rx).await;
        let accepted = if first.session() == 100 { first } else { second };
        assert_eq!(accepted.ptype(), PTYPE_SOCKET_ACCEPT);
        let server_fd: u32 = accepted.header().parse().unwrap();
        (server_fd, client)
    }
}

#[test]
fn test_echo_roundtrip_and_close_on_both_ends() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, client_fd) = h.pair().await;

        assert!(h.mux.write(client_fd, Arc::new(Buffer::from("abcd")), WriteFlag::None));
        h.mux.read(server_fd, owner(), 4, b"", 300);
        let data = next(&mut h.rx).await;
        assert_eq!(data.ptype(), PTYPE_SOCKET_DATA);
        assert_eq!(data.session(), 300);
        assert_eq!(data.sender().as_u32(), server_fd);
        assert_eq!(data.bytes(), b"abcd");

        // echo back the exact bytes
        assert!(h.mux.write(server_fd, Arc::new(Buffer::from(data.bytes())), WriteFlag::None));
        h.mux.read(client_fd, owner(), 4, b"", 301);
        let echoed = next(&mut h.rx).await;
        assert_eq!(echoed.bytes(), b"abcd");

        // close the client; both ends observe a close
        h.mux.read(server_fd, owner(), 1, b"", 302);
        assert!(h.mux.close(client_fd));
        let first = next(&mut h.rx).await;
        let second = next(&mut h.rx).await;
        for msg in [&first, &second] {
            assert_eq!(msg.ptype(), PTYPE_SOCKET_CLOSE);
        }
        let eof_side = [&first, &second]
            .into_iter()
            .find(|m| m.sender().as_u32() == server_fd)
            .expect("server side saw the close");
        assert_eq!(eof_side.session(), 302);
        assert_eq!(eof_side.header(), "eof");
        assert_eq!(h.mux.connection_count(), 0);
    });
}

#[test]
fn test_delimiter_and_exact_count_reads() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, client_fd) = h.pair().await;

        assert!(h.mux.write(
            client_fd,
            Arc::new(Buffer::from("one\r\ntwo\r\nrest")),
            WriteFlag::None
        ));

        h.mux.read(server_fd, owner(), 0, b"\r\n", 1);
        assert_eq!(next(&mut h.rx).await.bytes(), b"one");
        h.mux.read(server_fd, owner(), 0, b"\r\n", 2);
        assert_eq!(next(&mut h.rx).await.bytes(), b"two");
        // exact count picks up the leftover
        h.mux.read(server_fd, owner(), 4, b"", 3);
        assert_eq!(next(&mut h.rx).await.bytes(), b"rest");
    });
}

#[test]
fn test_second_read_while_pending_is_rejected() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, _client_fd) = h.pair().await;

        h.mux.read(server_fd, owner(), 4, b"", 1);
        h.mux.read(server_fd, owner(), 4, b"", 2);
        let rejected = next(&mut h.rx).await;
        assert_eq!(rejected.ptype(), PTYPE_SOCKET_ERROR);
        assert_eq!(rejected.session(), 2);
        assert_eq!(rejected.header(), "read already pending");
    });
}

#[test]
fn test_synchronous_connect() {
    run_local(async {
        let mut h = Harness::new();
        let (lfd, port) = h.listen();
        h.mux.accept(lfd, 10, owner());

        let client = h.mux.connect("127.0.0.1", port, owner(), PTYPE_SOCKET_ACCEPT, 0, 1000);
        assert!(client != 0, "synchronous connect returns the handle");
        let accepted = next(&mut h.rx).await;
        assert_eq!(accepted.session(), 10);
        assert!(!h.mux.getaddress(client).is_empty());
    });
}

#[test]
fn test_async_connect_failure_reports_on_session() {
    run_local(async {
        let mut h = Harness::new();
        // a freshly bound-then-dropped port: nothing is listening
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let fd = h.mux.connect("127.0.0.1", port, owner(), PTYPE_SOCKET_ACCEPT, 5, 1000);
        assert!(fd != 0);
        let failure = next(&mut h.rx).await;
        assert_eq!(failure.ptype(), PTYPE_SOCKET_ERROR);
        assert_eq!(failure.session(), 5);
        assert_eq!(h.mux.connection_count(), 0);
    });
}

#[test]
fn test_try_open_probe() {
    run_local(async {
        let h = Harness::new();
        let (_lfd, port) = h.listen();
        assert!(h.mux.try_open("127.0.0.1", port));
        let closed_port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        assert!(!h.mux.try_open("127.0.0.1", closed_port));
    });
}

#[test]
fn test_idle_timeout_sweep_closes_quiet_connections() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, _client_fd) = h.pair().await;

        assert!(h.mux.settimeout(server_fd, 1));
        // pretend a couple of seconds passed with no read activity
        h.mux.tick(u64::MAX / 2);
        let closed = next(&mut h.rx).await;
        assert_eq!(closed.ptype(), PTYPE_SOCKET_CLOSE);
        assert_eq!(closed.header(), "timeout");
        assert_eq!(closed.sender().as_u32(), server_fd);
    });
}

#[test]
fn test_close_after_send_drains_first() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, client_fd) = h.pair().await;

        assert!(h.mux.write(
            client_fd,
            Arc::new(Buffer::from("goodbye")),
            WriteFlag::CloseAfterSend
        ));
        h.mux.read(server_fd, owner(), 7, b"", 1);

        // the read completion and the writer's own close race; sort by fd
        let first = next(&mut h.rx).await;
        let second = next(&mut h.rx).await;
        let (data, client_close) = if first.sender().as_u32() == server_fd {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(data.bytes(), b"goodbye");
        assert_eq!(client_close.ptype(), PTYPE_SOCKET_CLOSE);
        assert_eq!(client_close.sender().as_u32(), client_fd);

        // writes after close-after-send are refused
        assert!(!h.mux.write(client_fd, Arc::new(Buffer::from("x")), WriteFlag::None));
    });
}

#[test]
fn test_write_chunked_is_invisible_to_the_stream() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, client_fd) = h.pair().await;

        assert!(h.mux.set_enable_chunked(client_fd, "w"));
        assert!(!h.mux.set_enable_chunked(client_fd, "x"));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        assert!(h.mux.write(client_fd, Arc::new(Buffer::from(payload.clone())), WriteFlag::None));

        let mut collected = Vec::new();
        while collected.len() < payload.len() {
            let remaining = payload.len() - collected.len();
            h.mux.read(server_fd, owner(), remaining.min(16 * 1024), b"", 1);
            collected.extend_from_slice(next(&mut h.rx).await.bytes());
        }
        assert_eq!(collected, payload);
    });
}

#[test]
fn test_send_queue_backpressure_rejects_and_recovers() {
    run_local(async {
        let mut h = Harness::new();
        let (server_fd, client_fd) = h.pair().await;
        assert!(h.mux.set_send_queue_limit(client_fd, 1024, 2048));

        // stall the peer (nobody reads server_fd) and write until rejected
        let chunk = vec![0x55u8; 512];
        let mut accepted_bytes = 0usize;
        let mut rejected = false;
        for _ in 0..40_000 {
            if h.mux.write(client_fd, Arc::new(Buffer::from(chunk.clone())), WriteFlag::None) {
                accepted_bytes += chunk.len();
            } else {
                rejected = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(rejected, "the hard limit must eventually reject writes");
        let overflow = next(&mut h.rx).await;
        assert_eq!(overflow.ptype(), PTYPE_SOCKET_ERROR);
        assert_eq!(overflow.header(), "send queue overflow");

        // drain the peer until the queue falls below the warn threshold
        let mut drained = 0usize;
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut recovered = false;
        while std::time::Instant::now() < deadline && drained < accepted_bytes {
            h.mux.read(server_fd, owner(), 0, b"", 9);
            let data = next(&mut h.rx).await;
            drained += data.size();
            if h.mux.write(client_fd, Arc::new(Buffer::from("again")), WriteFlag::None) {
                recovered = true;
                break;
            }
        }
        assert!(recovered, "writes must succeed again after the peer drains");
    });
}

#[test]
fn test_close_unknown_fd_and_acceptor() {
    run_local(async {
        let h = Harness::new();
        assert!(!h.mux.close(12345));
        let (lfd, _port) = h.listen();
        assert!(h.mux.close(lfd));
        assert!(!h.mux.close(lfd));
    });
}
