//! Integration tests for the initbus-bridge crate.
//!
//! These run the in-process bus entirely on a `MainLoop`: the bridge installs
//! the watches, timers and dispatch hooks, and the test only feeds the loop
//! the readiness `MemoryBus::poll` reports.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chrono::{DateTime, TimeDelta, Utc};
use initbus_bridge::interface::{Arg, Interface, Method};
use initbus_bridge::{
    BridgeError, ConnectHandler, ConnectionManager, DisconnectHandler, ErrorKind, ExportedObject,
    MethodCall, Object, build_path, decode_path_component,
};
use initbus_mainloop::{IoEvents, LoopConfig, MainLoop};
use initbus_transport::memory::{Fault, MemoryBus, MemoryConnection};
use initbus_transport::{
    BusConfig, BusKind, ConnectionRef, HandlerResult, Message, MessageType, ServerRef, Value,
    WatchFlags, names,
};
use tracing_subscriber::EnvFilter;

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn io_events(flags: WatchFlags) -> IoEvents {
    let mut events = IoEvents::empty();
    if flags.contains(WatchFlags::READABLE) {
        events |= IoEvents::READ;
    }
    if flags.contains(WatchFlags::WRITABLE) {
        events |= IoEvents::WRITE;
    }
    if flags.contains(WatchFlags::ERROR) {
        events |= IoEvents::EXCEPT;
    }
    events
}

struct Harness {
    bus: MemoryBus,
    main_loop: MainLoop,
    manager: ConnectionManager,
    time: Rc<Cell<DateTime<Utc>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_bus(MemoryBus::new())
    }

    fn with_bus(bus: MemoryBus) -> Self {
        init_tracing();
        let start = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        let time = Rc::new(Cell::new(start));
        let clock = Rc::clone(&time);
        let main_loop = MainLoop::with_clock(LoopConfig::default(), move || clock.get());
        let manager = ConnectionManager::new(Rc::new(bus.clone()), Rc::new(main_loop.clone()));
        Self {
            bus,
            main_loop,
            manager,
            time,
        }
    }

    /// Run enough loop iterations for every queued message to settle.
    fn pump(&self) {
        for _ in 0..16 {
            self.step();
        }
    }

    /// One loop iteration over whatever the bus reports ready.
    fn step(&self) {
        let ready: Vec<_> = self
            .bus
            .poll()
            .into_iter()
            .map(|(fd, flags)| (fd, io_events(flags)))
            .collect();
        self.main_loop.take_interrupt();
        self.main_loop.iterate(&ready);
    }

    fn advance(&self, seconds: i64) {
        self.time.set(self.time.get() + TimeDelta::seconds(seconds));
    }

    fn concrete(&self, connection: &ConnectionRef) -> Rc<MemoryConnection> {
        self.bus.connection(connection.id()).expect("tracked connection")
    }
}

/// Collects the server side of every accepted connection.
fn collecting_handler() -> (ConnectHandler, Rc<RefCell<Vec<ConnectionRef>>>) {
    let accepted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&accepted);
    let handler: ConnectHandler = Rc::new(move |_server: &ServerRef, connection: &ConnectionRef| {
        sink.borrow_mut().push(Rc::clone(connection));
        true
    });
    (handler, accepted)
}

fn counting_handler() -> (DisconnectHandler, Rc<Cell<usize>>) {
    let count = Rc::new(Cell::new(0));
    let c = Rc::clone(&count);
    let handler: DisconnectHandler = Rc::new(move |_connection: &ConnectionRef| c.set(c.get() + 1));
    (handler, count)
}

fn call(path: &str, interface: &str, member: &str) -> Message {
    Message::method_call(path, interface, member)
}

// ═══════════════════════════════════════════════════════════════════════
//  Interfaces
// ═══════════════════════════════════════════════════════════════════════

fn ping(_object: &Object, call: &MethodCall<'_>) -> HandlerResult {
    call.respond(vec![Value::String("pong".to_string())])
}

fn swallow(_object: &Object, _call: &MethodCall<'_>) -> HandlerResult {
    HandlerResult::Handled
}

fn describe(object: &Object, call: &MethodCall<'_>) -> HandlerResult {
    let name = object
        .data::<String>()
        .map(|n| n.as_str().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        let err = initbus_bridge::bus_error!(names::ERROR_FAILED, "{} has no job", object.path());
        return call.respond_error(&err);
    }
    call.respond(vec![Value::String(name)])
}

const DESCRIBE_ARGS: &[Arg] = &[Arg::output("name", "s")];
const PINGER: Interface = Interface::new(
    "com.example.Pinger",
    &[
        Method::new("Ping", &[], ping),
        Method::new("Swallow", &[], swallow),
        Method::new("Describe", DESCRIBE_ARGS, describe),
    ],
    &[],
    &[],
);
static PINGER_ONLY: [&Interface; 1] = [&PINGER];

// ═══════════════════════════════════════════════════════════════════════
//  Method dispatch end to end
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn ping_is_answered_and_pong_is_not() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=ping", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=ping", None).expect("open");
    h.pump();

    let service = accepted.borrow().first().cloned().expect("accepted");
    assert!(h.manager.has_dispatch_hook(&service));
    let _pinger = ExportedObject::register(&service, "/com/example/Pinger", &PINGER_ONLY, None)
        .expect("registered");

    let ping_serial = client
        .send(call("/com/example/Pinger", "com.example.Pinger", "Ping"))
        .expect("sent");
    let pong_serial = client
        .send(call("/com/example/Pinger", "com.example.Pinger", "Pong"))
        .expect("sent");
    h.pump();

    let replies = h.concrete(&client).take_unclaimed();
    let pong = replies
        .iter()
        .find(|m| m.reply_serial == Some(ping_serial))
        .expect("ping answered");
    assert_eq!(pong.kind, MessageType::MethodReturn);
    assert_eq!(pong.body, vec![Value::String("pong".to_string())]);

    let unknown = replies
        .iter()
        .find(|m| m.reply_serial == Some(pong_serial))
        .expect("pong answered by the bus");
    assert!(unknown.is_error(names::ERROR_UNKNOWN_METHOD));
}

#[test]
fn marshallers_can_answer_with_errors() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=describe", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=describe", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");

    let data: Rc<dyn std::any::Any> = Rc::new("ssh".to_string());
    let _named = ExportedObject::register(&service, "/jobs/ssh", &PINGER_ONLY, Some(data))
        .expect("registered");
    let _anonymous =
        ExportedObject::register(&service, "/jobs/anon", &PINGER_ONLY, None).expect("registered");

    let named = client
        .send(call("/jobs/ssh", "com.example.Pinger", "Describe"))
        .expect("sent");
    let anonymous = client
        .send(call("/jobs/anon", "com.example.Pinger", "Describe"))
        .expect("sent");
    h.pump();

    let replies = h.concrete(&client).take_unclaimed();
    let ok = replies
        .iter()
        .find(|m| m.reply_serial == Some(named))
        .expect("answered");
    assert_eq!(ok.body, vec![Value::String("ssh".to_string())]);

    let failed = replies
        .iter()
        .find(|m| m.reply_serial == Some(anonymous))
        .expect("answered");
    assert!(failed.is_error(names::ERROR_FAILED));
    assert_eq!(
        failed.body,
        vec![Value::String("/jobs/anon has no job".to_string())]
    );
}

#[test]
fn introspection_lists_interfaces_and_children() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=introspect", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=introspect", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");

    let root = "/com/example/Jobs";
    let _jobs = ExportedObject::register(&service, root, &PINGER_ONLY, None).expect("registered");
    let tty = build_path(root, &["tty 1"]);
    let _tty = ExportedObject::register(&service, &tty, &[], None).expect("registered");
    let _deep = ExportedObject::register(&service, &build_path(root, &["ssh", "main"]), &[], None)
        .expect("registered");

    let serial = client
        .send(call(root, names::INTERFACE_INTROSPECTABLE, "Introspect"))
        .expect("sent");
    h.pump();

    let replies = h.concrete(&client).take_unclaimed();
    let reply = replies
        .iter()
        .find(|m| m.reply_serial == Some(serial))
        .expect("introspected");
    let xml = reply.body[0].as_str().expect("string body");

    assert!(xml.starts_with(names::INTROSPECT_DOCTYPE));
    assert!(xml.contains("<node name=\"/com/example/Jobs\">\n"));
    assert!(xml.contains("  <interface name=\"com.example.Pinger\">\n"));
    assert!(xml.contains("      <arg name=\"name\" type=\"s\" direction=\"out\"/>\n"));
    assert!(!xml.contains(names::INTERFACE_PROPERTIES));
    assert!(xml.contains("  <node name=\"ssh\"/>\n  <node name=\"tty_201\"/>\n</node>\n"));
    assert_eq!(decode_path_component("tty_201").as_deref(), Some(&b"tty 1"[..]));
}

#[test]
fn introspection_failure_is_retried() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=retry", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=retry", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");
    let _obj = ExportedObject::register(&service, "/obj", &PINGER_ONLY, None).expect("registered");

    let serial = client
        .send(call("/obj", names::INTERFACE_INTROSPECTABLE, "Introspect"))
        .expect("sent");
    h.bus.fail_next(Fault::ListRegistered);
    h.pump();

    assert_eq!(h.concrete(&service).pending_dispatch(), 0);
    let replies = h.concrete(&client).take_unclaimed();
    assert!(replies.iter().any(|m| m.reply_serial == Some(serial)));
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn one_iteration_drains_every_queued_message() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=burst", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=burst", None).expect("open");
    h.pump();

    let service = accepted.borrow().first().cloned().expect("accepted");
    let receiver = h.concrete(&service);
    for _ in 0..5 {
        client
            .send(Message::signal("/com/example/Burst", "com.example.Burst", "Tick"))
            .expect("sent");
    }

    for _ in 0..8 {
        if receiver.pending_dispatch() > 0 {
            break;
        }
        h.step();
    }
    assert_eq!(receiver.pending_dispatch(), 5);

    h.main_loop.iterate(&[]);
    assert_eq!(receiver.pending_dispatch(), 0);
    assert_eq!(receiver.take_unclaimed().len(), 5);
}

#[test]
fn shared_setup_installs_one_hook_and_fires_every_handler() {
    let h = Harness::new();
    let _server = h
        .manager
        .listen("unix:abstract=shared", None, None)
        .expect("listen");

    let (first, first_count) = counting_handler();
    let (second, second_count) = counting_handler();
    let client = h
        .manager
        .open("unix:abstract=shared", Some(first))
        .expect("open");
    let funcs = h.main_loop.func_count();
    let watches = h.main_loop.watch_count();

    h.manager.setup(&client, Some(second)).expect("second setup");
    assert_eq!(h.main_loop.func_count(), funcs);
    assert_eq!(h.main_loop.watch_count(), watches);
    assert_eq!(h.manager.filter_count(&client), 2);
    assert_eq!(h.concrete(&client).filter_count(), 2);

    client.close();
    h.pump();
    assert_eq!(first_count.get(), 1);
    assert_eq!(second_count.get(), 1);
    assert_eq!(h.manager.bridged_counts(&client), Some((0, 0)));

    h.pump();
    assert_eq!(first_count.get(), 1);
    assert_eq!(second_count.get(), 1);
}

#[test]
fn lost_connection_is_released_and_its_hook_removed() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let (on_lost, lost) = counting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=lost", Some(accept), Some(on_lost))
        .expect("listen");
    let client = h.manager.open("unix:abstract=lost", None).expect("open");
    h.pump();

    let service_id = accepted.borrow().first().map(|c| c.id()).expect("accepted");
    accepted.borrow_mut().clear();
    assert_eq!(h.manager.connection_count(), 2);

    client.close();
    drop(client);
    h.pump();

    assert_eq!(lost.get(), 1);
    assert!(h.bus.connection(service_id).is_none());
    assert_eq!(h.manager.connection_count(), 0);
    assert_eq!(h.main_loop.func_count(), 0);
    assert_eq!(h.main_loop.watch_count(), 1);
}

#[test]
fn rejected_connection_is_dropped() {
    let h = Harness::new();
    let reject: ConnectHandler = Rc::new(|_server: &ServerRef, _connection: &ConnectionRef| false);
    let (on_lost, lost) = counting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=reject", Some(reject), None)
        .expect("listen");
    let client = h
        .manager
        .open("unix:abstract=reject", Some(on_lost))
        .expect("open");
    h.pump();

    assert!(!client.is_connected());
    assert_eq!(lost.get(), 1);
    assert_eq!(h.manager.connection_count(), 1);
}

#[test]
fn open_bus_keeps_the_process_alive_on_disconnect() {
    let config = BusConfig::default().with_address(BusKind::Session, "unix:abstract=session");
    let h = Harness::with_bus(MemoryBus::with_config(config));
    let (accept, accepted) = collecting_handler();
    let daemon = h
        .manager
        .listen("unix:abstract=session", Some(accept), None)
        .expect("listen");

    let (first, first_count) = counting_handler();
    let (second, second_count) = counting_handler();
    let a = h.manager.open_bus(BusKind::Session, Some(first)).expect("bus");
    let b = h.manager.open_bus(BusKind::Session, Some(second)).expect("bus");
    assert_eq!(a.id(), b.id());
    assert_eq!(h.manager.filter_count(&a), 2);

    let concrete = h.concrete(&a);
    assert!(!concrete.exits_on_disconnect());

    h.pump();
    h.manager.close_server(&daemon);
    assert_eq!(h.manager.server_count(), 0);
    assert!(a.is_connected());

    let peer = accepted.borrow_mut().pop().expect("accepted");
    peer.close();
    h.pump();

    assert!(!a.is_connected());
    assert_eq!(first_count.get(), 1);
    assert_eq!(second_count.get(), 1);
    assert!(!concrete.exit_requested());
}

#[test]
fn transport_errors_are_reported() {
    let h = Harness::new();
    let err = h
        .manager
        .open("unix:abstract=nobody", None)
        .err()
        .expect("nobody listening");
    assert_eq!(err.kind(), ErrorKind::Bus);
    assert_eq!(err.name(), names::ERROR_NO_SERVER);

    let _server = h
        .manager
        .listen("unix:abstract=taken", None, None)
        .expect("listen");
    let err = h
        .manager
        .listen("unix:abstract=taken", None, None)
        .err()
        .expect("in use");
    assert_eq!(err.name(), names::ERROR_ADDRESS_IN_USE);

    let err = h
        .manager
        .open_bus(BusKind::Session, None)
        .err()
        .expect("no session bus configured");
    assert_eq!(err.name(), names::ERROR_BAD_ADDRESS);
}

#[test]
fn failed_setup_closes_the_new_connection() {
    let h = Harness::new();
    let _server = h
        .manager
        .listen("unix:abstract=oom", None, None)
        .expect("listen");

    h.bus.fail_next(Fault::AddFilter);
    let err = h
        .manager
        .open("unix:abstract=oom", None)
        .err()
        .expect("setup failed");
    assert!(matches!(err, BridgeError::NoMemory));
    assert_eq!(h.manager.connection_count(), 0);
    assert_eq!(h.main_loop.func_count(), 0);
}

#[test]
fn exhausted_loop_tears_the_listener_down() {
    init_tracing();
    let bus = MemoryBus::new();
    let config = LoopConfig {
        max_watches: 0,
        ..LoopConfig::default()
    };
    let main_loop = MainLoop::with_config(config);
    let manager = ConnectionManager::new(Rc::new(bus.clone()), Rc::new(main_loop.clone()));

    let err = manager
        .listen("unix:abstract=full", None, None)
        .err()
        .expect("no room for watches");
    assert!(matches!(err, BridgeError::NoMemory));
    assert_eq!(manager.server_count(), 0);
    assert!(bus.connect("unix:abstract=full").is_err());
}

// ═══════════════════════════════════════════════════════════════════════
//  Timers
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn reply_timeout_runs_on_the_loop() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=timeout", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=timeout", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");
    let _obj = ExportedObject::register(&service, "/obj", &PINGER_ONLY, None).expect("registered");

    let serial = client
        .send(call("/obj", "com.example.Pinger", "Swallow"))
        .expect("sent");
    let start = h.time.get();
    assert_eq!(h.main_loop.next_due(), Some(start + TimeDelta::seconds(25)));

    h.advance(10);
    h.concrete(&client).set_reply_timeout(2500);
    assert_eq!(
        h.main_loop.next_due(),
        Some(start + TimeDelta::seconds(13))
    );

    h.pump();
    assert!(h.concrete(&client).take_unclaimed().is_empty());

    h.advance(3);
    h.pump();
    let replies = h.concrete(&client).take_unclaimed();
    let expired = replies
        .iter()
        .find(|m| m.reply_serial == Some(serial))
        .expect("timed out");
    assert!(expired.is_error(names::ERROR_NO_REPLY));
    assert_eq!(h.main_loop.next_due(), None);
}

// ═══════════════════════════════════════════════════════════════════════
//  Object lifetime
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn release_before_disconnect_unregisters_once() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=release", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=release", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");

    let exported =
        ExportedObject::register(&service, "/obj", &PINGER_ONLY, None).expect("registered");
    exported.release();
    assert_eq!(h.concrete(&service).unregister_calls(), 1);

    client.close();
    h.pump();
    assert_eq!(h.concrete(&service).unregister_calls(), 1);
}

#[test]
fn release_after_disconnect_is_a_no_op() {
    let h = Harness::new();
    let (accept, accepted) = collecting_handler();
    let _server = h
        .manager
        .listen("unix:abstract=late", Some(accept), None)
        .expect("listen");
    let client = h.manager.open("unix:abstract=late", None).expect("open");
    h.pump();
    let service = accepted.borrow().first().cloned().expect("accepted");
    let concrete = h.concrete(&service);

    let data: Rc<dyn std::any::Any> = Rc::new(42u32);
    let exported =
        ExportedObject::register(&service, "/obj", &PINGER_ONLY, Some(data)).expect("registered");

    client.close();
    h.pump();
    assert!(!exported.is_registered());
    assert!(exported.data::<u32>().is_none());
    assert!(concrete.registered_paths().is_empty());

    exported.release();
    assert_eq!(concrete.unregister_calls(), 0);
}
