//! End-to-end scheduler scenarios over a real multi-worker server
//!
//! A command-driven probe service forwards everything it observes through a
//! std channel so tests can assert on delivery order, sessions and flags
//! from outside the worker threads.

use selkie_core::message::{
    PTYPE_ERROR, PTYPE_SOCKET_ACCEPT, PTYPE_SOCKET_CLOSE, PTYPE_SOCKET_DATA, PTYPE_SYSTEM,
    PTYPE_TEXT, PTYPE_TIMER,
};
use selkie_core::{Buffer, Message, ServiceId};
use selkie_runtime::{Server, Service, ServiceConf, ServiceContext, WriteFlag};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Event {
    receiver: ServiceId,
    sender: ServiceId,
    session: i32,
    ptype: u8,
    header: String,
    bytes: Vec<u8>,
    broadcast: bool,
}

impl Event {
    fn from_message(receiver: ServiceId, msg: &Message) -> Self {
        Self {
            receiver,
            sender: msg.sender(),
            session: msg.session(),
            ptype: msg.ptype(),
            header: msg.header().to_string(),
            bytes: msg.bytes().to_vec(),
            broadcast: msg.broadcast(),
        }
    }
}

/// Records every message; a few magic headers drive side effects
struct Probe {
    events: Sender<Event>,
}

impl Service for Probe {
    fn init(&mut self, _ctx: &ServiceContext, _params: &str) -> bool {
        true
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message) {
        match msg.header() {
            "exit" => ctx.exit(7),
            header if header.starts_with("prefab:") => {
                let raw: u32 = header["prefab:".len()..].parse().unwrap();
                let receiver = ServiceId::from_raw(raw);
                let prefab_id = ctx.make_prefab(Buffer::from("fanout"));
                ctx.send_prefab(receiver, prefab_id, "", 0, PTYPE_TEXT)
                    .unwrap();
                assert!(ctx
                    .send_prefab(receiver, 0xDEAD_BEEF, "", 0, PTYPE_TEXT)
                    .is_err());
            }
            _ => {}
        }
        let _ = self.events.send(Event::from_message(ctx.id(), &msg));
    }
}

/// Replies to text requests with the payload and the negated session
struct Echo;

impl Service for Echo {
    fn init(&mut self, _ctx: &ServiceContext, _params: &str) -> bool {
        true
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message) {
        if msg.ptype() == PTYPE_TEXT && msg.session() > 0 {
            ctx.send(
                msg.sender(),
                Some(Buffer::from(msg.bytes())),
                "",
                -msg.session(),
                PTYPE_TEXT,
            )
            .unwrap();
        }
    }
}

/// Arms timers in init, reports expiries, then cancels after fire
///
/// With params "cancel" it arms two timers and lazily cancels the first.
struct TimerProbe {
    events: Sender<Event>,
}

impl Service for TimerProbe {
    fn init(&mut self, ctx: &ServiceContext, params: &str) -> bool {
        let timer_id = ctx.timeout(50);
        assert_eq!(timer_id, 1);
        if params == "cancel" {
            ctx.remove_timer(timer_id);
            assert_eq!(ctx.timeout(80), 2);
        }
        true
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, _msg: Message) {}

    fn on_timer(&mut self, ctx: &ServiceContext, timer_id: u32) {
        // cancelling an already-fired timer is a no-op
        ctx.remove_timer(timer_id);
        let _ = self.events.send(Event {
            receiver: ctx.id(),
            sender: ServiceId::ZERO,
            session: 0,
            ptype: PTYPE_TIMER,
            header: timer_id.to_string(),
            bytes: Vec::new(),
            broadcast: false,
        });
    }
}

/// Accepts one connection and echoes newline-framed lines back over it
struct Gate {
    events: Sender<Event>,
}

impl Service for Gate {
    fn init(&mut self, ctx: &ServiceContext, _params: &str) -> bool {
        let listener = ctx
            .socket()
            .listen("127.0.0.1", 0, ctx.id(), PTYPE_SOCKET_ACCEPT);
        if listener == 0 {
            return false;
        }
        ctx.set_env("gate_addr", &ctx.socket().getaddress(listener));
        ctx.socket().accept(listener, 1, ctx.id());
        true
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message) {
        match msg.ptype() {
            PTYPE_SOCKET_ACCEPT => {
                let fd: u32 = msg.header().parse().unwrap();
                ctx.socket().read(fd, ctx.id(), 0, b"\n", 2);
            }
            PTYPE_SOCKET_DATA => {
                let fd = msg.sender().as_u32();
                let mut line = msg.bytes().to_vec();
                line.push(b'\n');
                assert!(ctx
                    .socket()
                    .write(fd, Arc::new(Buffer::from(line)), WriteFlag::None));
                ctx.socket().read(fd, ctx.id(), 0, b"\n", 2);
            }
            _ => {}
        }
        let _ = self.events.send(Event::from_message(ctx.id(), &msg));
    }
}

fn start_server(workers: usize) -> (Arc<Server>, Receiver<Event>) {
    let server = Server::new(workers).unwrap();
    let (tx, rx) = channel();
    let probe_tx = tx.clone();
    server.register("probe", move || {
        Box::new(Probe {
            events: probe_tx.clone(),
        }) as Box<dyn Service>
    });
    let timer_tx = tx.clone();
    server.register("timer-probe", move || {
        Box::new(TimerProbe {
            events: timer_tx.clone(),
        }) as Box<dyn Service>
    });
    let gate_tx = tx;
    server.register("gate", move || {
        Box::new(Gate {
            events: gate_tx.clone(),
        }) as Box<dyn Service>
    });
    server.register("echo", || Box::new(Echo) as Box<dyn Service>);
    server.start().unwrap();
    (server, rx)
}

fn boot(server: &Arc<Server>, kind: &str, conf: ServiceConf) -> ServiceId {
    server
        .new_service(kind, conf, ServiceId::ZERO, 0)
        .expect("boot service")
}

fn on_worker(worker_hint: u32) -> ServiceConf {
    ServiceConf {
        worker_hint,
        ..Default::default()
    }
}

fn recv(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(RECV_TIMEOUT).expect("no event arrived")
}

#[test]
fn test_echo_roundtrip_across_workers() {
    let (server, rx) = start_server(2);
    let echo = boot(&server, "echo", on_worker(1));
    let probe = boot(&server, "probe", on_worker(2));
    assert_eq!(echo.worker_id(), 1);
    assert_eq!(probe.worker_id(), 2);

    server
        .send(probe, echo, Some(Buffer::from("hi")), "", 7, PTYPE_TEXT)
        .unwrap();

    let reply = recv(&rx);
    assert_eq!(reply.sender, echo);
    assert_eq!(reply.session, -7);
    assert_eq!(reply.bytes, b"hi");
    assert!(!reply.broadcast);

    server.stop(0);
    assert_eq!(server.run(), 0);
}

#[test]
fn test_fifo_per_sender_receiver_pair() {
    let (server, rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));
    let sender = ServiceId::compose(2, 1);

    for i in 0..100u32 {
        server
            .send(
                sender,
                probe,
                Some(Buffer::from(i.to_string().as_str())),
                "",
                0,
                PTYPE_TEXT,
            )
            .unwrap();
    }
    for i in 0..100u32 {
        assert_eq!(recv(&rx).bytes, i.to_string().as_bytes());
    }

    server.stop(0);
    server.run();
}

#[test]
fn test_broadcast_reaches_everyone_but_the_sender() {
    let (server, rx) = start_server(3);
    let x = boot(&server, "probe", on_worker(1));
    let y = boot(&server, "probe", on_worker(2));
    let z = boot(&server, "probe", on_worker(3));

    server.broadcast(x, Buffer::from("p"), 99).unwrap();

    let first = recv(&rx);
    let second = recv(&rx);
    let mut receivers = vec![first.receiver, second.receiver];
    receivers.sort();
    assert_eq!(receivers, {
        let mut expected = vec![y, z];
        expected.sort();
        expected
    });
    for event in [first, second] {
        assert!(event.broadcast);
        assert_eq!(event.sender, x);
        assert_eq!(event.bytes, b"p");
        assert_eq!(event.ptype, 99);
    }
    // the sender observes nothing
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    server.stop(0);
    server.run();
}

#[test]
fn test_timer_fires_exactly_once() {
    let (server, rx) = start_server(1);
    boot(&server, "timer-probe", on_worker(1));

    let fired = recv(&rx);
    assert_eq!(fired.ptype, PTYPE_TIMER);
    assert_eq!(fired.header, "1");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    server.stop(0);
    server.run();
}

#[test]
fn test_unique_collision_has_one_winner() {
    let (server, rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));

    let unique = |session: i32| {
        let server = server.clone();
        std::thread::spawn(move || {
            let conf = ServiceConf {
                name: "db".into(),
                unique: true,
                ..Default::default()
            };
            server.new_service("echo", conf, probe, session).unwrap();
        })
    };
    let first = unique(11);
    let second = unique(12);
    first.join().unwrap();
    second.join().unwrap();

    let a = recv(&rx);
    let b = recv(&rx);
    let (ack, err) = if a.ptype == PTYPE_SYSTEM { (a, b) } else { (b, a) };
    assert_eq!(ack.ptype, PTYPE_SYSTEM);
    assert_eq!(err.ptype, PTYPE_ERROR);
    assert!(ack.session == -11 || ack.session == -12);
    assert!(err.session == -11 || err.session == -12);
    assert_ne!(ack.session, err.session);

    let winner: u32 = String::from_utf8(ack.bytes).unwrap().parse().unwrap();
    assert_eq!(server.get_unique_service("db"), ServiceId::from_raw(winner));

    server.stop(0);
    server.run();
}

#[test]
fn test_remove_service_acks_and_dead_sends_bounce() {
    let (server, rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));
    let echo = boot(&server, "echo", on_worker(2));

    server.remove_service(echo, probe, 21).unwrap();
    let ack = recv(&rx);
    assert_eq!(ack.ptype, PTYPE_SYSTEM);
    assert_eq!(ack.session, -21);

    server
        .send(probe, echo, Some(Buffer::from("late")), "", 31, PTYPE_TEXT)
        .unwrap();
    let bounce = recv(&rx);
    assert_eq!(bounce.ptype, PTYPE_ERROR);
    assert_eq!(bounce.session, -31);
    assert_eq!(bounce.sender, echo);
    assert_eq!(bounce.header, "service not found");

    server.stop(0);
    server.run();
}

#[test]
fn test_scan_services_lists_the_worker() {
    let (server, rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));
    boot(
        &server,
        "echo",
        ServiceConf {
            name: "lonely".into(),
            worker_hint: 2,
            ..Default::default()
        },
    );

    server.scan_services(probe, 2, 41).unwrap();
    let listing = recv(&rx);
    assert_eq!(listing.ptype, PTYPE_SYSTEM);
    assert_eq!(listing.session, -41);
    let parsed: serde_json::Value = serde_json::from_slice(&listing.bytes).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "lonely");

    assert!(server.scan_services(probe, 9, 42).is_err());

    server.stop(0);
    server.run();
}

#[test]
fn test_runcmd_answers_and_rejects() {
    let (server, rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));

    server.runcmd(probe, "worker.count", 43);
    let answer = recv(&rx);
    assert_eq!(answer.ptype, PTYPE_SYSTEM);
    assert_eq!(answer.session, -43);
    assert_eq!(answer.header, "worker.count");
    assert_eq!(answer.bytes, b"2");

    server.runcmd(probe, "no.such.command", 44);
    let rejection = recv(&rx);
    assert_eq!(rejection.ptype, PTYPE_ERROR);
    assert_eq!(rejection.session, -44);

    server.stop(0);
    server.run();
}

#[test]
fn test_prefab_fanout_within_a_worker() {
    let (server, rx) = start_server(1);
    let a = boot(&server, "probe", on_worker(1));
    let b = boot(&server, "probe", on_worker(1));

    server
        .send(
            ServiceId::compose(1, 99),
            a,
            None,
            &format!("prefab:{}", b.as_u32()),
            0,
            PTYPE_TEXT,
        )
        .unwrap();

    // a records the instruction, b records the prefab payload
    let events = [recv(&rx), recv(&rx)];
    let delivered = events
        .iter()
        .find(|event| event.receiver == b)
        .expect("prefab payload delivered");
    assert_eq!(delivered.bytes, b"fanout");
    assert_eq!(delivered.sender, a);

    server.stop(0);
    server.run();
}

#[test]
fn test_pinned_worker_is_skipped_by_placement() {
    let (server, _rx) = start_server(2);
    boot(
        &server,
        "echo",
        ServiceConf {
            shared: false,
            worker_hint: 2,
            ..Default::default()
        },
    );
    for _ in 0..4 {
        let id = boot(&server, "echo", ServiceConf::default());
        assert_eq!(id.worker_id(), 1, "pinned worker must not be chosen");
    }

    server.stop(0);
    server.run();
}

#[test]
fn test_exit_from_handler_sets_the_code() {
    let (server, _rx) = start_server(2);
    let probe = boot(&server, "probe", on_worker(1));

    server
        .send(ServiceId::compose(2, 9), probe, None, "exit", 0, PTYPE_TEXT)
        .unwrap();

    assert_eq!(server.run(), 7);
}

#[test]
fn test_cancelled_timer_never_fires() {
    let (server, rx) = start_server(1);
    boot(
        &server,
        "timer-probe",
        ServiceConf {
            worker_hint: 1,
            params: "cancel".into(),
            ..Default::default()
        },
    );

    let fired = recv(&rx);
    assert_eq!(fired.ptype, PTYPE_TIMER);
    assert_eq!(fired.header, "2", "only the uncancelled timer fires");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    server.stop(0);
    server.run();
}

#[test]
fn test_socket_completions_flow_through_the_worker() {
    use std::io::{BufRead, BufReader, Write};

    let (server, rx) = start_server(2);
    boot(&server, "gate", on_worker(2));
    let address = server.get_env("gate_addr").expect("gate published its address");

    let mut stream = std::net::TcpStream::connect(&address).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"ping\n").unwrap();
    let mut line = String::new();
    BufReader::new(stream.try_clone().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line, "ping\n");

    // the gate observed the accept and the data as ordinary messages
    let accept = recv(&rx);
    assert_eq!(accept.ptype, PTYPE_SOCKET_ACCEPT);
    assert_eq!(accept.session, 1);
    let data = recv(&rx);
    assert_eq!(data.ptype, PTYPE_SOCKET_DATA);
    assert_eq!(data.bytes, b"ping");

    drop(stream);
    let closed = recv(&rx);
    assert_eq!(closed.ptype, PTYPE_SOCKET_CLOSE);
    assert_eq!(closed.header, "eof");

    server.stop(0);
    server.run();
}

#[test]
fn test_unknown_kind_fails_boot() {
    let (server, _rx) = start_server(1);
    let result = server.new_service("nope", ServiceConf::default(), ServiceId::ZERO, 0);
    assert!(result.is_err());
    server.stop(0);
    server.run();
}
