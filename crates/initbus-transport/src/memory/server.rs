//! Listening endpoint of the in-process bus.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use super::{BusInner, MemoryConnection, MemoryWatch};
use crate::connection::{
    Connection, ConnectionRef, NewConnectionFn, Server, ServerId, ServerRef, TimeoutHooks, Watch,
    WatchFlags, WatchHooks, WatchRef,
};

/// A listening endpoint.  Inbound connections wait in a pending queue until
/// the accept watch is handled, then go to the new-connection callback.
///
/// Accepted connections nobody keeps a reference to are closed, the way a
/// bus library drops connections its new-connection callback did not adopt.
pub struct MemoryServer {
    id: ServerId,
    address: String,
    bus: Rc<BusInner>,
    fd: RawFd,
    me: Weak<MemoryServer>,
    listening: Cell<bool>,
    pending: RefCell<VecDeque<Rc<MemoryConnection>>>,
    accept_watch: Rc<MemoryWatch>,
    watch_hooks: RefCell<Option<Rc<dyn WatchHooks>>>,
    timeout_hooks: RefCell<Option<Rc<dyn TimeoutHooks>>>,
    new_connection: RefCell<Option<Rc<dyn Fn(&ServerRef, ConnectionRef)>>>,
    accepted: Cell<usize>,
}

impl MemoryServer {
    pub(crate) fn new(bus: &Rc<BusInner>, address: &str) -> Rc<Self> {
        let fd = bus.allocate_fd();
        Rc::new_cyclic(|me: &Weak<Self>| {
            let acceptor = me.clone();
            Self {
                id: ServerId::new(),
                address: address.to_string(),
                bus: Rc::clone(bus),
                fd,
                me: me.clone(),
                listening: Cell::new(true),
                pending: RefCell::new(VecDeque::new()),
                accept_watch: Rc::new(MemoryWatch::new(fd, WatchFlags::READABLE, true, move |_| {
                    acceptor.upgrade().is_none_or(|s| s.accept_pending())
                })),
                watch_hooks: RefCell::new(None),
                timeout_hooks: RefCell::new(None),
                new_connection: RefCell::new(None),
                accepted: Cell::new(0),
            }
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    pub fn unix_fd(&self) -> RawFd {
        self.fd
    }

    /// Connections handed to the new-connection callback so far.
    pub fn accepted_count(&self) -> usize {
        self.accepted.get()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn has_watch_hooks(&self) -> bool {
        self.watch_hooks.borrow().is_some()
    }

    pub fn has_timeout_hooks(&self) -> bool {
        self.timeout_hooks.borrow().is_some()
    }

    pub(crate) fn queue_pending(&self, connection: Rc<MemoryConnection>) {
        self.pending.borrow_mut().push_back(connection);
    }

    pub(crate) fn readiness(&self) -> Option<(RawFd, WatchFlags)> {
        let ready = self.listening.get()
            && self.accept_watch.is_enabled()
            && !self.pending.borrow().is_empty();
        ready.then_some((self.fd, WatchFlags::READABLE))
    }

    /// Accept watch fired: hand every pending connection to the callback.
    fn accept_pending(&self) -> bool {
        let Some(this) = self.me.upgrade() else {
            return true;
        };
        let this: ServerRef = this;

        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(connection) = next else {
                break;
            };

            let callback = self.new_connection.borrow().clone();
            let Some(callback) = callback else {
                tracing::debug!(server = %self.id, "no new-connection callback, closing inbound connection");
                connection.close();
                continue;
            };

            self.accepted.set(self.accepted.get() + 1);
            tracing::debug!(server = %self.id, connection = %connection.id(), "inbound connection accepted");

            let adopted: ConnectionRef = connection.clone();
            callback(&this, adopted);
            if Rc::strong_count(&connection) == 1 {
                tracing::debug!(connection = %connection.id(), "inbound connection not adopted, closing");
                connection.close();
            }
        }
        true
    }
}

impl Server for MemoryServer {
    fn id(&self) -> ServerId {
        self.id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn is_connected(&self) -> bool {
        self.listening.get()
    }

    fn set_watch_hooks(&self, hooks: Option<Rc<dyn WatchHooks>>) -> bool {
        let watch: WatchRef = Rc::clone(&self.accept_watch) as WatchRef;

        let previous = self.watch_hooks.borrow_mut().take();
        if let Some(previous) = previous {
            previous.remove_watch(&watch);
        }
        let Some(hooks) = hooks else {
            return true;
        };
        if !self.listening.get() {
            return true;
        }
        if !hooks.add_watch(&watch) {
            return false;
        }
        *self.watch_hooks.borrow_mut() = Some(hooks);
        true
    }

    fn set_timeout_hooks(&self, hooks: Option<Rc<dyn TimeoutHooks>>) -> bool {
        // Servers own no timeouts; the hooks are only remembered.
        *self.timeout_hooks.borrow_mut() = hooks;
        true
    }

    fn set_new_connection(&self, callback: Option<NewConnectionFn>) {
        *self.new_connection.borrow_mut() = callback.map(Rc::from);
    }

    fn disconnect(&self) {
        if !self.listening.replace(false) {
            return;
        }
        tracing::debug!(server = %self.id, address = %self.address, "memory server stopped");
        self.bus.forget_server(&self.address);

        let hooks = self.watch_hooks.borrow_mut().take();
        if let Some(hooks) = hooks {
            hooks.remove_watch(&(Rc::clone(&self.accept_watch) as WatchRef));
        }
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        for connection in pending {
            connection.close();
        }
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        if let Some(hooks) = self.watch_hooks.get_mut().take() {
            hooks.remove_watch(&(Rc::clone(&self.accept_watch) as WatchRef));
        }
        if self.listening.get() {
            self.bus.forget_server(&self.address);
        }
    }
}
