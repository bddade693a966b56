//! Connection and server lifecycle.
//!
//! The [`ConnectionManager`] hooks bus connections and listening servers
//! into a host loop.  Setting up a connection installs, once per connection:
//!
//! - a per-iteration function that drains everything already dispatched,
//! - a [`WatchBridge`] and a [`TimerBridge`] as the connection's hooks,
//! - a wake-up callback that interrupts the host loop,
//!
//! and, on every call, one more disconnect filter carrying the caller's
//! handler.  A connection shared between several callers therefore has one
//! dispatch hook and one set of hooks but one filter per caller; each filter
//! fires its handler when the connection is lost.
//!
//! # Ownership
//!
//! Each setup takes a [`ConnectionToken`], a strong reference to the
//! connection moved into the disconnect filter.  The token keeps the
//! connection alive until it is lost, then the filter releases it.
//!
//! # Example
//!
//! ```rust
//! use std::rc::Rc;
//!
//! use initbus_bridge::ConnectionManager;
//! use initbus_mainloop::MainLoop;
//! use initbus_transport::memory::MemoryBus;
//!
//! let bus = MemoryBus::new();
//! let main_loop = MainLoop::new();
//! let manager = ConnectionManager::new(Rc::new(bus.clone()), Rc::new(main_loop.clone()));
//!
//! let _server = manager.listen("unix:abstract=jobs", None, None).unwrap();
//! let client = manager.open("unix:abstract=jobs", None).unwrap();
//! assert!(manager.has_dispatch_hook(&client));
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use initbus_mainloop::{FuncHandle, HostLoop};
use initbus_transport::{
    BusKind, ConnectionId, ConnectionRef, DispatchStatus, Filter, HandlerResult,
    Message, Server, ServerId, ServerRef, TimeoutHooks, Transport, WatchHooks, names,
};

use crate::error::{BridgeError, Result};
use crate::timer::TimerBridge;
use crate::watch::WatchBridge;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Called once when a connection is lost.
pub type DisconnectHandler = Rc<dyn Fn(&ConnectionRef)>;

/// Decides whether a server keeps an inbound connection.
pub type ConnectHandler = Rc<dyn Fn(&ServerRef, &ConnectionRef) -> bool>;

/// Single-owner reference keeping a connection alive until it is lost.
///
/// Not `Clone`: each setup takes one token and its disconnect filter
/// releases that one.
pub struct ConnectionToken {
    connection: ConnectionRef,
}

impl ConnectionToken {
    /// Take a reference to `connection`.
    pub fn take(connection: &ConnectionRef) -> Self {
        Self {
            connection: Rc::clone(connection),
        }
    }

    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    /// Give the reference up.
    pub fn release(self) {
        tracing::trace!(connection = %self.connection.id(), "connection token released");
    }
}

/// Whether `message` is the local signal announcing a lost connection.
pub fn is_disconnected(message: &Message) -> bool {
    message.is_signal(names::INTERFACE_LOCAL, names::SIGNAL_DISCONNECTED)
        && message.has_path(names::PATH_LOCAL)
}

/// Build the disconnect filter for one setup.
///
/// On the local `Disconnected` signal the filter calls `handler` and
/// releases `token`, once.  It never claims the message, so every other
/// filter sees the disconnect too.
pub fn disconnect_filter(handler: Option<DisconnectHandler>, token: ConnectionToken) -> Filter {
    let mut token = Some(token);
    Box::new(move |connection: &ConnectionRef, message: &Message| {
        if !is_disconnected(message) {
            return HandlerResult::NotYetHandled;
        }
        let Some(token) = token.take() else {
            return HandlerResult::NotYetHandled;
        };

        tracing::debug!(connection = %connection.id(), "bus connection disconnected");
        if let Some(handler) = &handler {
            handler(connection);
        }
        token.release();

        HandlerResult::NotYetHandled
    })
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Bridge state of one set-up connection.
struct ConnectionState {
    dispatch: FuncHandle,
    watches: Rc<WatchBridge>,
    timers: Rc<TimerBridge>,
    filters: usize,
}

/// Bridge state of one listening server.
struct ServerState {
    server: Weak<dyn Server>,
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
}

/// Hooks bus connections and servers into a host loop.
///
/// The manager is cheaply cloneable (`Rc`-backed); all clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Rc<ManagerInner>,
}

struct ManagerInner {
    transport: Rc<dyn Transport>,
    host: Rc<dyn HostLoop>,
    connections: RefCell<HashMap<ConnectionId, ConnectionState>>,
    servers: RefCell<HashMap<ServerId, ServerState>>,
}

impl ConnectionManager {
    pub fn new(transport: Rc<dyn Transport>, host: Rc<dyn HostLoop>) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                transport,
                host,
                connections: RefCell::new(HashMap::new()),
                servers: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn host(&self) -> &Rc<dyn HostLoop> {
        &self.inner.host
    }

    /// Open a private connection to `address` and set it up.
    pub fn open(
        &self,
        address: &str,
        disconnect: Option<DisconnectHandler>,
    ) -> Result<ConnectionRef> {
        let connection = self.inner.transport.open(address).map_err(|e| {
            tracing::warn!(address = %address, error = %e, "failed to open bus connection");
            BridgeError::from(e)
        })?;

        if let Err(e) = self.setup(&connection, disconnect) {
            tracing::warn!(address = %address, error = %e, "failed to set up bus connection");
            connection.close();
            return Err(BridgeError::NoMemory);
        }

        tracing::info!(address = %address, connection = %connection.id(), "bus connection opened");
        Ok(connection)
    }

    /// Connect to a well-known bus and set the connection up.
    ///
    /// Losing the connection never terminates the process; the disconnect
    /// handler is the only notification.
    pub fn open_bus(
        &self,
        kind: BusKind,
        disconnect: Option<DisconnectHandler>,
    ) -> Result<ConnectionRef> {
        let connection = self.inner.transport.bus(kind).map_err(|e| {
            tracing::warn!(bus = %kind, error = %e, "failed to connect to bus");
            BridgeError::from(e)
        })?;

        connection.set_exit_on_disconnect(false);

        if let Err(e) = self.setup(&connection, disconnect) {
            tracing::warn!(bus = %kind, error = %e, "failed to set up bus connection");
            return Err(BridgeError::NoMemory);
        }

        tracing::info!(bus = %kind, connection = %connection.id(), "connected to bus");
        Ok(connection)
    }

    /// Hook `connection` into the host loop and add a disconnect filter
    /// carrying `disconnect`.
    ///
    /// The loop hooks are installed only the first time a connection is set
    /// up; later calls only add their filter.  Fails only on resource
    /// exhaustion, leaving nothing this call installed behind.
    pub fn setup(
        &self,
        connection: &ConnectionRef,
        disconnect: Option<DisconnectHandler>,
    ) -> Result<()> {
        let id = connection.id();
        let installed = if self.has_dispatch_hook(connection) {
            tracing::debug!(connection = %id, "connection already set up, adding filter only");
            false
        } else {
            self.install_hooks(connection)?;
            true
        };

        let filter = disconnect_filter(disconnect, ConnectionToken::take(connection));
        if !connection.add_filter(filter) {
            tracing::warn!(connection = %id, "failed to add disconnect filter");
            if installed {
                self.remove_hooks(connection);
            }
            return Err(BridgeError::NoMemory);
        }

        if let Some(state) = self.inner.connections.borrow_mut().get_mut(&id) {
            state.filters += 1;
        }
        Ok(())
    }

    /// Listen at `address`, accepting inbound connections through
    /// `connect` and setting each accepted one up with `disconnect`.
    pub fn listen(
        &self,
        address: &str,
        connect: Option<ConnectHandler>,
        disconnect: Option<DisconnectHandler>,
    ) -> Result<ServerRef> {
        let server = self.inner.transport.listen(address).map_err(|e| {
            tracing::warn!(address = %address, error = %e, "failed to listen");
            BridgeError::from(e)
        })?;

        self.prune_servers();
        self.inner.servers.borrow_mut().insert(
            server.id(),
            ServerState {
                server: Rc::downgrade(&server),
                connect,
                disconnect,
            },
        );

        let watches = Rc::new(WatchBridge::new(Rc::clone(&self.inner.host)));
        let timers = Rc::new(TimerBridge::new(Rc::clone(&self.inner.host)));
        let hooked = server.set_watch_hooks(Some(watches as Rc<dyn WatchHooks>))
            && server.set_timeout_hooks(Some(timers as Rc<dyn TimeoutHooks>));
        if !hooked {
            tracing::warn!(address = %address, "failed to hook server into the loop");
            self.teardown_server(&server);
            return Err(BridgeError::NoMemory);
        }

        let manager = Rc::downgrade(&self.inner);
        server.set_new_connection(Some(Box::new(
            move |server: &ServerRef, connection: ConnectionRef| {
                if let Some(inner) = manager.upgrade() {
                    ConnectionManager { inner }.on_new_connection(server, connection);
                }
            },
        )));

        tracing::info!(address = %address, server = %server.id(), "listening for bus connections");
        Ok(server)
    }

    /// Handle one inbound connection on `server`.
    ///
    /// The connect handler may reject the connection, in which case nothing
    /// keeps it and the transport drops it.  Otherwise the connection is set
    /// up with the server's disconnect handler, whose token keeps it alive.
    pub fn on_new_connection(&self, server: &ServerRef, connection: ConnectionRef) {
        let handlers = self
            .inner
            .servers
            .borrow()
            .get(&server.id())
            .map(|s| (s.connect.clone(), s.disconnect.clone()));
        let (connect, disconnect) = handlers.unwrap_or_default();

        if let Some(connect) = connect {
            if !connect(server, &connection) {
                tracing::debug!(server = %server.id(), connection = %connection.id(), "inbound connection rejected");
                return;
            }
        }

        match self.setup(&connection, disconnect) {
            Ok(()) => {
                tracing::debug!(server = %server.id(), connection = %connection.id(), "inbound connection set up");
            }
            Err(e) => {
                tracing::warn!(server = %server.id(), connection = %connection.id(), error = %e, "failed to set up inbound connection");
            }
        }
    }

    /// Stop `server` and forget its handlers.
    pub fn close_server(&self, server: &ServerRef) {
        self.teardown_server(server);
        tracing::info!(server = %server.id(), "server closed");
    }

    /// Whether `connection` has its dispatch hook installed.
    pub fn has_dispatch_hook(&self, connection: &ConnectionRef) -> bool {
        self.inner
            .connections
            .borrow()
            .contains_key(&connection.id())
    }

    /// Number of disconnect filters added through this manager.
    pub fn filter_count(&self, connection: &ConnectionRef) -> usize {
        self.inner
            .connections
            .borrow()
            .get(&connection.id())
            .map_or(0, |s| s.filters)
    }

    /// Host-loop watch and timer records held for `connection`.
    pub fn bridged_counts(&self, connection: &ConnectionRef) -> Option<(usize, usize)> {
        self.inner
            .connections
            .borrow()
            .get(&connection.id())
            .map(|s| (s.watches.len(), s.timers.len()))
    }

    /// Number of connections with an installed dispatch hook.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    /// Number of servers whose handlers are held.
    pub fn server_count(&self) -> usize {
        self.inner.servers.borrow().len()
    }

    // -- Internals -----------------------------------------------------------

    fn install_hooks(&self, connection: &ConnectionRef) -> Result<()> {
        let id = connection.id();
        let host = &self.inner.host;

        let dispatch = host
            .add_func(dispatch_hook(connection, Rc::downgrade(&self.inner)))
            .map_err(|e| {
                tracing::warn!(connection = %id, error = %e, "failed to add dispatch hook");
                BridgeError::NoMemory
            })?;

        let watches = Rc::new(WatchBridge::new(Rc::clone(host)));
        let timers = Rc::new(TimerBridge::new(Rc::clone(host)));

        if !connection.set_watch_hooks(Some(Rc::clone(&watches) as Rc<dyn WatchHooks>)) {
            tracing::warn!(connection = %id, "failed to install watch hooks");
            remove_dispatch_hook(&**host, id, dispatch);
            return Err(BridgeError::NoMemory);
        }
        if !connection.set_timeout_hooks(Some(Rc::clone(&timers) as Rc<dyn TimeoutHooks>)) {
            tracing::warn!(connection = %id, "failed to install timeout hooks");
            connection.set_watch_hooks(None);
            remove_dispatch_hook(&**host, id, dispatch);
            return Err(BridgeError::NoMemory);
        }

        let wake = Rc::clone(host);
        connection.set_wakeup_main(Some(Box::new(move || wake_loop(&*wake))));

        self.inner.connections.borrow_mut().insert(
            id,
            ConnectionState {
                dispatch,
                watches,
                timers,
                filters: 0,
            },
        );
        tracing::debug!(connection = %id, "connection hooked into the loop");
        Ok(())
    }

    fn remove_hooks(&self, connection: &ConnectionRef) {
        let removed = self.inner.connections.borrow_mut().remove(&connection.id());
        let Some(state) = removed else {
            return;
        };
        connection.set_wakeup_main(None);
        connection.set_timeout_hooks(None);
        connection.set_watch_hooks(None);
        remove_dispatch_hook(&*self.inner.host, connection.id(), state.dispatch);
    }

    fn teardown_server(&self, server: &ServerRef) {
        server.set_new_connection(None);
        server.set_timeout_hooks(None);
        server.set_watch_hooks(None);
        server.disconnect();
        self.inner.servers.borrow_mut().remove(&server.id());
    }

    fn prune_servers(&self) {
        self.inner
            .servers
            .borrow_mut()
            .retain(|_, s| s.server.strong_count() > 0);
    }
}

/// Ask the host loop to stop waiting and poll again.
pub fn wake_loop(host: &dyn HostLoop) {
    tracing::trace!("waking host loop");
    host.interrupt();
}

/// The per-iteration function draining one connection.
///
/// Once the connection is gone the function removes itself and the
/// connection's bridge state.
fn dispatch_hook(connection: &ConnectionRef, manager: Weak<ManagerInner>) -> Box<dyn FnMut()> {
    let id = connection.id();
    let target = Rc::downgrade(connection);

    Box::new(move || {
        if let Some(connection) = target.upgrade() {
            while connection.dispatch() == DispatchStatus::DataRemains {}
            return;
        }

        let Some(inner) = manager.upgrade() else {
            return;
        };
        let removed = inner.connections.borrow_mut().remove(&id);
        if let Some(state) = removed {
            tracing::debug!(connection = %id, "connection gone, removing dispatch hook");
            remove_dispatch_hook(&*inner.host, id, state.dispatch);
        }
    })
}

/// Remove a connection's dispatch hook; returns whether the loop still had it.
fn remove_dispatch_hook(host: &dyn HostLoop, connection: ConnectionId, hook: FuncHandle) -> bool {
    match host.remove_func(hook) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(connection = %connection, error = %e, "failed to remove dispatch hook");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use initbus_mainloop::{LoopConfig, MainLoop};
    use initbus_transport::memory::{Fault, MemoryBus};

    use super::*;

    fn manager(bus: &MemoryBus, main_loop: &MainLoop) -> ConnectionManager {
        ConnectionManager::new(Rc::new(bus.clone()), Rc::new(main_loop.clone()))
    }

    #[test]
    fn filter_ignores_other_messages() {
        let bus = MemoryBus::new();
        let _server = bus.bind("unix:abstract=filter").expect("listen");
        let connection: ConnectionRef = bus.connect("unix:abstract=filter").expect("open");

        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let handler: DisconnectHandler = Rc::new(move |_: &ConnectionRef| c.set(c.get() + 1));
        let mut filter = disconnect_filter(Some(handler), ConnectionToken::take(&connection));

        let signal = Message::signal(names::PATH_LOCAL, "com.example.Other", "Disconnected");
        assert_eq!(filter(&connection, &signal), HandlerResult::NotYetHandled);
        let wrong_path = Message::signal("/elsewhere", names::INTERFACE_LOCAL, "Disconnected");
        assert_eq!(filter(&connection, &wrong_path), HandlerResult::NotYetHandled);
        assert_eq!(calls.get(), 0);
        assert_eq!(Rc::strong_count(&connection), 2);

        let disconnected = Message::disconnected();
        assert_eq!(filter(&connection, &disconnected), HandlerResult::NotYetHandled);
        assert_eq!(filter(&connection, &disconnected), HandlerResult::NotYetHandled);
        assert_eq!(calls.get(), 1);
        assert_eq!(Rc::strong_count(&connection), 1);
    }

    #[test]
    fn setup_twice_installs_hooks_once() {
        let bus = MemoryBus::new();
        let main_loop = MainLoop::new();
        let manager = manager(&bus, &main_loop);
        let _server = bus.bind("unix:abstract=twice").expect("listen");
        let connection: ConnectionRef = bus.connect("unix:abstract=twice").expect("open");

        manager.setup(&connection, None).expect("first");
        let watches = main_loop.watch_count();
        let timers = main_loop.timer_count();
        manager.setup(&connection, None).expect("second");

        assert_eq!(main_loop.func_count(), 1);
        assert_eq!(main_loop.watch_count(), watches);
        assert_eq!(main_loop.timer_count(), timers);
        assert_eq!(manager.filter_count(&connection), 2);
        assert_eq!(manager.bridged_counts(&connection), Some((2, 1)));
    }

    #[test]
    fn queued_traffic_wakes_the_loop() {
        let bus = MemoryBus::new();
        let main_loop = MainLoop::new();
        let manager = manager(&bus, &main_loop);
        let _server = bus.bind("unix:abstract=wake").expect("listen");
        let connection: ConnectionRef = bus.connect("unix:abstract=wake").expect("open");

        manager.setup(&connection, None).expect("setup");
        assert!(!main_loop.take_interrupt());

        connection
            .send(Message::signal("/job", "com.example.Job", "Started"))
            .expect("queued");
        assert!(main_loop.take_interrupt());
    }

    #[test]
    fn stale_dispatch_hook_removal_is_reported() {
        let main_loop = MainLoop::new();
        let hook = main_loop.add_func(Box::new(|| {})).expect("func");
        let id = ConnectionId::new();

        assert!(remove_dispatch_hook(&main_loop, id, hook));
        assert_eq!(main_loop.func_count(), 0);
        assert!(!remove_dispatch_hook(&main_loop, id, hook));
    }

    #[test]
    fn exhausted_loop_fails_setup_cleanly() {
        let bus = MemoryBus::new();
        let config = LoopConfig {
            max_funcs: 0,
            ..LoopConfig::default()
        };
        let main_loop = MainLoop::with_config(config);
        let manager = manager(&bus, &main_loop);
        let _server = bus.bind("unix:abstract=full").expect("listen");
        let connection: ConnectionRef = bus.connect("unix:abstract=full").expect("open");

        let err = manager.setup(&connection, None).expect_err("no room");
        assert!(matches!(err, BridgeError::NoMemory));
        assert!(!manager.has_dispatch_hook(&connection));
        assert_eq!(main_loop.watch_count(), 0);
    }

    #[test]
    fn failed_filter_unwinds_fresh_hooks() {
        let bus = MemoryBus::new();
        let main_loop = MainLoop::new();
        let manager = manager(&bus, &main_loop);
        let _server = bus.bind("unix:abstract=nofilter").expect("listen");
        let connection: ConnectionRef = bus.connect("unix:abstract=nofilter").expect("open");

        bus.fail_next(Fault::AddFilter);
        let err = manager.setup(&connection, None).expect_err("filter refused");
        assert!(matches!(err, BridgeError::NoMemory));
        assert!(!manager.has_dispatch_hook(&connection));
        assert_eq!(main_loop.func_count(), 0);
        assert_eq!(main_loop.watch_count(), 0);
        assert_eq!(main_loop.timer_count(), 0);
        assert_eq!(Rc::strong_count(&connection), 1);
    }

    #[test]
    fn open_reports_transport_errors() {
        let bus = MemoryBus::new();
        let main_loop = MainLoop::new();
        let manager = manager(&bus, &main_loop);

        let err = manager
            .open("unix:abstract=absent", None)
            .err()
            .expect("nobody listening");
        assert_eq!(err.name(), names::ERROR_NO_SERVER);
        assert_eq!(manager.connection_count(), 0);
    }
}
