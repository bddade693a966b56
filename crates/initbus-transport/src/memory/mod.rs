//! In-process bus.
//!
//! [`MemoryBus`] implements [`Transport`] without any wire protocol: messages
//! move between paired [`MemoryConnection`]s as values.  It still behaves like
//! a socket-backed bus library from the driver's point of view: every
//! endpoint owns a (synthetic) file descriptor, announces watches and a reply
//! timeout through the installed hooks, toggles its write watch while data is
//! queued, wakes the driver when work is pending, and only moves data when
//! its watches are handled.  [`MemoryBus::poll`] reports which descriptors
//! are ready, standing in for the kernel's readiness mechanism.
//!
//! # Example
//!
//! ```rust
//! # use initbus_transport::memory::MemoryBus;
//! # use initbus_transport::{Connection, Transport};
//! let bus = MemoryBus::new();
//! let _server = bus.listen("unix:abstract=jobs").unwrap();
//! let client = bus.open("unix:abstract=jobs").unwrap();
//! assert!(client.is_connected());
//! ```

mod connection;
mod server;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

pub use connection::MemoryConnection;
pub use server::MemoryServer;

use crate::config::BusConfig;
use crate::connection::{
    BusKind, Connection, ConnectionId, ConnectionRef, Server, ServerRef, Timeout, TimeoutId,
    Transport, Watch, WatchFlags, WatchId,
};
use crate::error::BusError;
use crate::names;

/// Interval of the per-connection reply timeout.
pub const DEFAULT_REPLY_TIMEOUT_MS: u32 = 25_000;

/// First synthetic file descriptor handed out.
const FIRST_FD: RawFd = 100;

/// Operations whose next invocation can be made to fail, to exercise
/// resource-exhaustion paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    AddFilter,
    RegisterObjectPath,
    ListRegistered,
    Send,
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// In-process bus shared by every endpoint created from it.
///
/// The bus is cheaply cloneable (`Rc`-backed) and single-threaded.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Rc<BusInner>,
}

pub(crate) struct BusInner {
    config: BusConfig,
    next_fd: Cell<RawFd>,
    next_unique: Cell<u32>,
    servers: RefCell<HashMap<String, Weak<MemoryServer>>>,
    connections: RefCell<Vec<Weak<MemoryConnection>>>,
    shared: RefCell<HashMap<BusKind, Weak<MemoryConnection>>>,
    faults: RefCell<Vec<Fault>>,
}

impl BusInner {
    pub(crate) fn allocate_fd(&self) -> RawFd {
        let fd = self.next_fd.get();
        self.next_fd.set(fd + 1);
        fd
    }

    pub(crate) fn allocate_unique_name(&self) -> String {
        let n = self.next_unique.get();
        self.next_unique.set(n + 1);
        format!(":1.{n}")
    }

    /// Consume a pending fault for `fault`, reporting whether one was armed.
    pub(crate) fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.faults.borrow_mut();
        match faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                faults.remove(pos);
                tracing::trace!(?fault, "injected fault triggered");
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget_server(&self, address: &str) {
        self.servers.borrow_mut().remove(address);
    }
}

impl MemoryBus {
    /// Create a bus with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus resolving well-known buses through `config`.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Rc::new(BusInner {
                config,
                next_fd: Cell::new(FIRST_FD),
                next_unique: Cell::new(1),
                servers: RefCell::new(HashMap::new()),
                connections: RefCell::new(Vec::new()),
                shared: RefCell::new(HashMap::new()),
                faults: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Make the next invocation of `fault` fail as if out of memory.
    pub fn fail_next(&self, fault: Fault) {
        self.inner.faults.borrow_mut().push(fault);
    }

    /// Open a private connection, returning the concrete endpoint.
    pub fn connect(&self, address: &str) -> Result<Rc<MemoryConnection>, BusError> {
        validate_address(address)?;

        let server = self
            .inner
            .servers
            .borrow()
            .get(address)
            .and_then(Weak::upgrade)
            .filter(|s| s.is_listening());
        let Some(server) = server else {
            return Err(BusError::new(
                names::ERROR_NO_SERVER,
                format!("Failed to connect to socket {address}: Connection refused"),
            ));
        };

        let client = MemoryConnection::new(&self.inner, false);
        let remote = MemoryConnection::new(&self.inner, false);
        MemoryConnection::pair(&client, &remote);
        self.track(&client);
        self.track(&remote);

        tracing::debug!(address = %address, connection = %client.id(), "memory connection opened");
        server.queue_pending(remote);
        Ok(client)
    }

    /// Start listening, returning the concrete endpoint.
    pub fn bind(&self, address: &str) -> Result<Rc<MemoryServer>, BusError> {
        validate_address(address)?;

        let in_use = self
            .inner
            .servers
            .borrow()
            .get(address)
            .and_then(Weak::upgrade)
            .is_some_and(|s| s.is_listening());
        if in_use {
            return Err(BusError::new(
                names::ERROR_ADDRESS_IN_USE,
                format!("Failed to bind socket \"{address}\": Address already in use"),
            ));
        }

        let server = MemoryServer::new(&self.inner, address);
        self.inner
            .servers
            .borrow_mut()
            .insert(address.to_string(), Rc::downgrade(&server));

        tracing::debug!(address = %address, server = %server.id(), "memory server listening");
        Ok(server)
    }

    /// Look up a live connection by identity.
    pub fn connection(&self, id: ConnectionId) -> Option<Rc<MemoryConnection>> {
        self.inner
            .connections
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|c| c.id() == id)
    }

    /// Number of connection endpoints still alive.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .borrow()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Descriptors that are ready, with the conditions that hold on each.
    ///
    /// Only conditions some enabled watch asked for are reported.
    pub fn poll(&self) -> Vec<(RawFd, WatchFlags)> {
        let mut ready = Vec::new();

        let connections: Vec<_> = {
            let mut list = self.inner.connections.borrow_mut();
            list.retain(|c| c.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        ready.extend(connections.iter().filter_map(|c| c.readiness()));

        let servers: Vec<_> = self
            .inner
            .servers
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        ready.extend(servers.iter().filter_map(|s| s.readiness()));

        ready
    }

    fn track(&self, connection: &Rc<MemoryConnection>) {
        self.inner
            .connections
            .borrow_mut()
            .push(Rc::downgrade(connection));
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryBus {
    fn open(&self, address: &str) -> Result<ConnectionRef, BusError> {
        Ok(self.connect(address)?)
    }

    fn bus(&self, kind: BusKind) -> Result<ConnectionRef, BusError> {
        let existing = self
            .inner
            .shared
            .borrow()
            .get(&kind)
            .and_then(Weak::upgrade)
            .filter(|c| c.is_connected());
        if let Some(connection) = existing {
            tracing::trace!(bus = %kind, connection = %connection.id(), "reusing shared bus connection");
            return Ok(connection);
        }

        let address = self.inner.config.address(kind).ok_or_else(|| {
            BusError::new(
                names::ERROR_BAD_ADDRESS,
                format!("Unable to determine the address of the {kind} bus"),
            )
        })?;
        let connection = self.connect(address)?;
        connection.set_exit_on_disconnect(self.inner.config.exit_on_disconnect);
        self.inner
            .shared
            .borrow_mut()
            .insert(kind, Rc::downgrade(&connection));

        tracing::debug!(bus = %kind, connection = %connection.id(), "shared bus connection opened");
        Ok(connection)
    }

    fn listen(&self, address: &str) -> Result<ServerRef, BusError> {
        Ok(self.bind(address)?)
    }
}

/// Addresses look like `transport:key=value,...`.
fn validate_address(address: &str) -> Result<(), BusError> {
    match address.split_once(':') {
        Some((transport, _)) if !transport.is_empty() => Ok(()),
        _ => Err(BusError::new(
            names::ERROR_BAD_ADDRESS,
            format!("Address \"{address}\" does not contain a transport prefix"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Watches and timeouts
// ---------------------------------------------------------------------------

/// Watch owned by a memory endpoint.
pub struct MemoryWatch {
    id: WatchId,
    fd: RawFd,
    flags: WatchFlags,
    enabled: Cell<bool>,
    on_ready: Box<dyn Fn(WatchFlags) -> bool>,
}

impl MemoryWatch {
    pub(crate) fn new(
        fd: RawFd,
        flags: WatchFlags,
        enabled: bool,
        on_ready: impl Fn(WatchFlags) -> bool + 'static,
    ) -> Self {
        Self {
            id: WatchId::new(),
            fd,
            flags,
            enabled: Cell::new(enabled),
            on_ready: Box::new(on_ready),
        }
    }

    /// Update the enabled flag, reporting whether it changed.
    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.replace(enabled) != enabled
    }
}

impl Watch for MemoryWatch {
    fn id(&self) -> WatchId {
        self.id
    }

    fn unix_fd(&self) -> RawFd {
        self.fd
    }

    fn flags(&self) -> WatchFlags {
        self.flags
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn handle(&self, flags: WatchFlags) -> bool {
        (self.on_ready)(flags)
    }
}

/// Timeout owned by a memory endpoint.
pub struct MemoryTimeout {
    id: TimeoutId,
    interval_ms: Cell<u32>,
    enabled: Cell<bool>,
    on_expire: Box<dyn Fn() -> bool>,
}

impl MemoryTimeout {
    pub(crate) fn new(interval_ms: u32, on_expire: impl Fn() -> bool + 'static) -> Self {
        Self {
            id: TimeoutId::new(),
            interval_ms: Cell::new(interval_ms),
            enabled: Cell::new(false),
            on_expire: Box::new(on_expire),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.replace(enabled) != enabled
    }

    pub(crate) fn set_interval(&self, interval_ms: u32) {
        self.interval_ms.set(interval_ms);
    }
}

impl Timeout for MemoryTimeout {
    fn id(&self) -> TimeoutId {
        self.id
    }

    fn interval_ms(&self) -> u32 {
        self.interval_ms.get()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn handle(&self) -> bool {
        (self.on_expire)()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
