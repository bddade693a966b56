//! One end of an in-process connection.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use super::{BusInner, DEFAULT_REPLY_TIMEOUT_MS, Fault, MemoryTimeout, MemoryWatch};
use crate::connection::{
    Connection, ConnectionId, ConnectionRef, Filter, ObjectPathHandler, TimeoutHooks, TimeoutRef,
    WakeupFn, WatchFlags, WatchHooks, WatchRef,
};
use crate::error::BusError;
use crate::message::{DispatchStatus, HandlerResult, Message, MessageType};
use crate::names;

/// One end of an in-process connection.
///
/// Traffic flows in three stages: messages the peer sent sit on the *wire*
/// until the read watch is handled, then wait in the *incoming* queue until
/// [`Connection::dispatch`] pops them.  Outbound messages sit in the
/// *outgoing* queue, with the write watch enabled, until the write watch is
/// handled and they are moved onto the peer's wire.
pub struct MemoryConnection {
    id: ConnectionId,
    bus: Rc<BusInner>,
    fd: RawFd,
    unique_name: String,
    me: Weak<MemoryConnection>,
    peer: RefCell<Weak<MemoryConnection>>,

    connected: Cell<bool>,
    peer_closed: Cell<bool>,
    exit_on_disconnect: Cell<bool>,
    exit_requested: Cell<bool>,
    next_serial: Cell<u32>,

    wire: RefCell<VecDeque<Message>>,
    incoming: RefCell<VecDeque<Message>>,
    outgoing: RefCell<VecDeque<Message>>,
    unclaimed: RefCell<VecDeque<Message>>,
    /// Serials of sent method calls still waiting for an answer.
    awaiting_reply: RefCell<Vec<u32>>,

    filters: RefCell<Vec<Filter>>,
    objects: RefCell<BTreeMap<String, Rc<dyn ObjectPathHandler>>>,
    unregistrations: Cell<usize>,

    read_watch: Rc<MemoryWatch>,
    write_watch: Rc<MemoryWatch>,
    reply_timeout: Rc<MemoryTimeout>,
    watch_hooks: RefCell<Option<Rc<dyn WatchHooks>>>,
    timeout_hooks: RefCell<Option<Rc<dyn TimeoutHooks>>>,
    wakeup: RefCell<Option<Rc<dyn Fn()>>>,
}

impl MemoryConnection {
    pub(crate) fn new(bus: &Rc<BusInner>, exit_on_disconnect: bool) -> Rc<Self> {
        let fd = bus.allocate_fd();
        let unique_name = bus.allocate_unique_name();

        Rc::new_cyclic(|me: &Weak<Self>| {
            let reader = me.clone();
            let writer = me.clone();
            let expirer = me.clone();

            Self {
                id: ConnectionId::new(),
                bus: Rc::clone(bus),
                fd,
                unique_name,
                me: me.clone(),
                peer: RefCell::new(Weak::new()),
                connected: Cell::new(true),
                peer_closed: Cell::new(false),
                exit_on_disconnect: Cell::new(exit_on_disconnect),
                exit_requested: Cell::new(false),
                next_serial: Cell::new(1),
                wire: RefCell::new(VecDeque::new()),
                incoming: RefCell::new(VecDeque::new()),
                outgoing: RefCell::new(VecDeque::new()),
                unclaimed: RefCell::new(VecDeque::new()),
                awaiting_reply: RefCell::new(Vec::new()),
                filters: RefCell::new(Vec::new()),
                objects: RefCell::new(BTreeMap::new()),
                unregistrations: Cell::new(0),
                read_watch: Rc::new(MemoryWatch::new(fd, WatchFlags::READABLE, true, move |_| {
                    reader.upgrade().is_none_or(|c| c.read())
                })),
                write_watch: Rc::new(MemoryWatch::new(fd, WatchFlags::WRITABLE, false, move |_| {
                    writer.upgrade().is_none_or(|c| c.flush())
                })),
                reply_timeout: Rc::new(MemoryTimeout::new(DEFAULT_REPLY_TIMEOUT_MS, move || {
                    expirer.upgrade().is_none_or(|c| c.expire_replies())
                })),
                watch_hooks: RefCell::new(None),
                timeout_hooks: RefCell::new(None),
                wakeup: RefCell::new(None),
            }
        })
    }

    pub(crate) fn pair(a: &Rc<Self>, b: &Rc<Self>) {
        *a.peer.borrow_mut() = Rc::downgrade(b);
        *b.peer.borrow_mut() = Rc::downgrade(a);
    }

    // -- Inspection ---------------------------------------------------------

    /// Name the bus assigned to this endpoint, used as message sender.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// The synthetic descriptor both watches poll.
    pub fn unix_fd(&self) -> RawFd {
        self.fd
    }

    pub fn exits_on_disconnect(&self) -> bool {
        self.exit_on_disconnect.get()
    }

    /// Whether a disconnect happened while exit-on-disconnect was set.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.get()
    }

    pub fn filter_count(&self) -> usize {
        self.filters.borrow().len()
    }

    pub fn has_watch_hooks(&self) -> bool {
        self.watch_hooks.borrow().is_some()
    }

    pub fn has_timeout_hooks(&self) -> bool {
        self.timeout_hooks.borrow().is_some()
    }

    pub fn has_wakeup(&self) -> bool {
        self.wakeup.borrow().is_some()
    }

    /// Paths with a registered handler, sorted.
    pub fn registered_paths(&self) -> Vec<String> {
        self.objects.borrow().keys().cloned().collect()
    }

    /// Number of explicit [`Connection::unregister_object_path`] calls that
    /// found a handler.
    pub fn unregister_calls(&self) -> usize {
        self.unregistrations.get()
    }

    /// Number of messages read but not yet dispatched.
    pub fn pending_dispatch(&self) -> usize {
        self.incoming.borrow().len()
    }

    /// Drain messages no filter or object claimed (replies, signals).
    pub fn take_unclaimed(&self) -> Vec<Message> {
        self.unclaimed.borrow_mut().drain(..).collect()
    }

    /// Change the reply timeout interval, notifying the driver the way bus
    /// libraries do: by toggling the timeout.
    pub fn set_reply_timeout(&self, interval_ms: u32) {
        self.reply_timeout.set_interval(interval_ms);
        let hooks = self.timeout_hooks.borrow().clone();
        if let Some(hooks) = hooks {
            hooks.timeout_toggled(&self.timeout_ref());
        }
    }

    // -- Readiness ----------------------------------------------------------

    pub(crate) fn readiness(&self) -> Option<(RawFd, WatchFlags)> {
        if !self.connected.get() {
            return None;
        }

        let mut flags = WatchFlags::empty();
        if self.read_watch.enabled.get() {
            if !self.wire.borrow().is_empty() {
                flags |= WatchFlags::READABLE;
            }
            if self.peer_closed.get() {
                flags |= WatchFlags::READABLE | WatchFlags::HANGUP;
            }
        }
        if self.write_watch.enabled.get() {
            flags |= WatchFlags::WRITABLE;
        }

        (!flags.is_empty()).then_some((self.fd, flags))
    }

    // -- Watch and timeout handling -----------------------------------------

    fn this(&self) -> Option<ConnectionRef> {
        self.me.upgrade().map(|c| c as ConnectionRef)
    }

    fn watches(&self) -> [WatchRef; 2] {
        [
            Rc::clone(&self.read_watch) as WatchRef,
            Rc::clone(&self.write_watch) as WatchRef,
        ]
    }

    fn timeout_ref(&self) -> TimeoutRef {
        Rc::clone(&self.reply_timeout) as TimeoutRef
    }

    fn wake(&self) {
        let wakeup = self.wakeup.borrow().clone();
        if let Some(wakeup) = wakeup {
            wakeup();
        }
    }

    fn set_write_enabled(&self, enabled: bool) {
        if !self.write_watch.set_enabled(enabled) {
            return;
        }
        let hooks = self.watch_hooks.borrow().clone();
        if let Some(hooks) = hooks {
            hooks.watch_toggled(&(Rc::clone(&self.write_watch) as WatchRef));
        }
    }

    fn set_timeout_enabled(&self, enabled: bool) {
        if !self.reply_timeout.set_enabled(enabled) {
            return;
        }
        let hooks = self.timeout_hooks.borrow().clone();
        if let Some(hooks) = hooks {
            hooks.timeout_toggled(&self.timeout_ref());
        }
    }

    /// Read watch fired: move the wire into the dispatch queue.
    fn read(&self) -> bool {
        let arrived: Vec<Message> = self.wire.borrow_mut().drain(..).collect();
        for message in arrived {
            if let Some(serial) = message.reply_serial {
                self.settle_reply(serial);
            }
            tracing::trace!(
                connection = %self.id,
                serial = message.serial,
                kind = ?message.kind,
                "message read"
            );
            self.incoming.borrow_mut().push_back(message);
        }

        if self.peer_closed.get() {
            self.lose_connection();
        }
        true
    }

    /// Write watch fired: hand queued messages to the peer.
    fn flush(&self) -> bool {
        let queued: Vec<Message> = self.outgoing.borrow_mut().drain(..).collect();
        let peer = self.peer.borrow().upgrade();
        match peer {
            Some(peer) if !self.peer_closed.get() => peer.deliver(queued),
            _ => tracing::trace!(connection = %self.id, dropped = queued.len(), "peer gone, outgoing dropped"),
        }
        self.set_write_enabled(false);
        true
    }

    fn deliver(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.wire.borrow_mut().extend(messages);
        self.wake();
    }

    fn settle_reply(&self, serial: u32) {
        let now_idle = {
            let mut awaiting = self.awaiting_reply.borrow_mut();
            awaiting.retain(|s| *s != serial);
            awaiting.is_empty()
        };
        if now_idle {
            self.set_timeout_enabled(false);
        }
    }

    /// Reply timeout fired: every call still waiting gets a `NoReply` error.
    fn expire_replies(&self) -> bool {
        let expired: Vec<u32> = self.awaiting_reply.borrow_mut().drain(..).collect();
        for serial in expired {
            tracing::debug!(connection = %self.id, serial, "method call timed out");
            self.incoming.borrow_mut().push_back(Message::error(
                serial,
                names::ERROR_NO_REPLY,
                "Did not receive a reply",
            ));
        }
        self.set_timeout_enabled(false);
        self.wake();
        true
    }

    // -- Disconnection ------------------------------------------------------

    /// The connection is gone: withdraw watches and timeouts from the
    /// driver and queue the local `Disconnected` signal.
    fn lose_connection(&self) {
        if !self.connected.replace(false) {
            return;
        }
        tracing::debug!(connection = %self.id, "memory connection lost");

        self.awaiting_reply.borrow_mut().clear();
        self.outgoing.borrow_mut().clear();

        let watch_hooks = self.watch_hooks.borrow_mut().take();
        if let Some(hooks) = watch_hooks {
            for watch in self.watches() {
                hooks.remove_watch(&watch);
            }
        }
        let timeout_hooks = self.timeout_hooks.borrow_mut().take();
        if let Some(hooks) = timeout_hooks {
            hooks.remove_timeout(&self.timeout_ref());
        }

        self.incoming.borrow_mut().push_back(Message::disconnected());
        self.wake();
    }

    /// Runs after the `Disconnected` signal went through the filters.
    fn finish_disconnect(&self, this: &ConnectionRef) {
        let objects = std::mem::take(&mut *self.objects.borrow_mut());
        for (path, handler) in objects {
            tracing::trace!(connection = %self.id, path = %path, "object path dropped with connection");
            handler.unregister(this);
        }

        if self.exit_on_disconnect.get() {
            tracing::warn!(connection = %self.id, "bus connection lost with exit-on-disconnect set");
            self.exit_requested.set(true);
        }
    }

    fn notify_peer_closed(&self) {
        let peer = self.peer.borrow().upgrade();
        if let Some(peer) = peer {
            peer.peer_closed.set(true);
            peer.wake();
        }
    }

    // -- Dispatch -----------------------------------------------------------

    fn run_filters(&self, this: &ConnectionRef, message: &Message) -> HandlerResult {
        // Filters may add filters while running; those land in the emptied
        // slot and are appended afterwards.
        let mut filters = std::mem::take(&mut *self.filters.borrow_mut());

        let mut result = HandlerResult::NotYetHandled;
        for filter in filters.iter_mut() {
            result = filter(this, message);
            if result != HandlerResult::NotYetHandled {
                break;
            }
        }

        let mut slot = self.filters.borrow_mut();
        filters.append(&mut slot);
        *slot = filters;
        result
    }

    fn dispatch_to_object(&self, this: &ConnectionRef, message: &Message) -> HandlerResult {
        let handler = message
            .path
            .as_deref()
            .and_then(|path| self.objects.borrow().get(path).cloned());

        let result = match handler {
            Some(handler) => handler.message(this, message),
            None => HandlerResult::NotYetHandled,
        };

        if result == HandlerResult::NotYetHandled && message.expects_reply() {
            let text = format!(
                "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
                message.member.as_deref().unwrap_or_default(),
                message.signature(),
                message.interface.as_deref().unwrap_or_default(),
            );
            if self
                .send(Message::error_reply(message, names::ERROR_UNKNOWN_METHOD, text))
                .is_none()
            {
                return HandlerResult::NeedMemory;
            }
            return HandlerResult::Handled;
        }
        result
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn set_exit_on_disconnect(&self, exit: bool) {
        self.exit_on_disconnect.set(exit);
    }

    fn set_watch_hooks(&self, hooks: Option<Rc<dyn WatchHooks>>) -> bool {
        let previous = self.watch_hooks.borrow_mut().take();
        if let Some(previous) = previous {
            for watch in self.watches() {
                previous.remove_watch(&watch);
            }
        }

        let Some(hooks) = hooks else {
            return true;
        };
        if !self.connected.get() {
            return true;
        }

        let watches = self.watches();
        for (i, watch) in watches.iter().enumerate() {
            if !hooks.add_watch(watch) {
                for added in &watches[..i] {
                    hooks.remove_watch(added);
                }
                return false;
            }
        }
        *self.watch_hooks.borrow_mut() = Some(hooks);
        true
    }

    fn set_timeout_hooks(&self, hooks: Option<Rc<dyn TimeoutHooks>>) -> bool {
        let previous = self.timeout_hooks.borrow_mut().take();
        if let Some(previous) = previous {
            previous.remove_timeout(&self.timeout_ref());
        }

        let Some(hooks) = hooks else {
            return true;
        };
        if !self.connected.get() {
            return true;
        }

        if !hooks.add_timeout(&self.timeout_ref()) {
            return false;
        }
        *self.timeout_hooks.borrow_mut() = Some(hooks);
        true
    }

    fn set_wakeup_main(&self, wakeup: Option<WakeupFn>) {
        *self.wakeup.borrow_mut() = wakeup.map(Rc::from);
    }

    fn add_filter(&self, filter: Filter) -> bool {
        if self.bus.take_fault(Fault::AddFilter) {
            return false;
        }
        self.filters.borrow_mut().push(filter);
        true
    }

    fn dispatch(&self) -> DispatchStatus {
        let Some(this) = self.this() else {
            return DispatchStatus::Complete;
        };
        let next = self.incoming.borrow_mut().pop_front();
        let Some(message) = next else {
            return DispatchStatus::Complete;
        };

        let is_disconnect = message.is_signal(names::INTERFACE_LOCAL, names::SIGNAL_DISCONNECTED)
            && message.has_path(names::PATH_LOCAL);

        let mut result = self.run_filters(&this, &message);
        if result == HandlerResult::NotYetHandled {
            result = match message.kind {
                MessageType::MethodCall => self.dispatch_to_object(&this, &message),
                _ if is_disconnect => HandlerResult::NotYetHandled,
                _ => {
                    self.unclaimed.borrow_mut().push_back(message.clone());
                    HandlerResult::NotYetHandled
                }
            };
        }

        if result == HandlerResult::NeedMemory {
            self.incoming.borrow_mut().push_front(message);
            return DispatchStatus::NeedMemory;
        }

        if is_disconnect {
            self.finish_disconnect(&this);
        }

        if self.incoming.borrow().is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    fn register_object_path(
        &self,
        path: &str,
        handler: Rc<dyn ObjectPathHandler>,
    ) -> Result<(), BusError> {
        if self.bus.take_fault(Fault::RegisterObjectPath) {
            return Err(BusError::new(names::ERROR_NO_MEMORY, "Not enough memory"));
        }

        let mut objects = self.objects.borrow_mut();
        if objects.contains_key(path) {
            return Err(BusError::new(
                names::ERROR_OBJECT_PATH_IN_USE,
                format!("An object is already registered at {path}"),
            ));
        }
        objects.insert(path.to_string(), handler);
        tracing::trace!(connection = %self.id, path = %path, "object path registered");
        Ok(())
    }

    fn unregister_object_path(&self, path: &str) -> bool {
        let removed = self.objects.borrow_mut().remove(path);
        let Some(handler) = removed else {
            return false;
        };
        self.unregistrations.set(self.unregistrations.get() + 1);
        tracing::trace!(connection = %self.id, path = %path, "object path unregistered");

        if let Some(this) = self.this() {
            handler.unregister(&this);
        }
        true
    }

    fn list_registered(&self, parent: &str) -> Option<Vec<String>> {
        if self.bus.take_fault(Fault::ListRegistered) {
            return None;
        }

        let prefix = if parent.ends_with('/') {
            parent.to_string()
        } else {
            format!("{parent}/")
        };

        let mut children: Vec<String> = Vec::new();
        for path in self.objects.borrow().keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or_default();
            if !child.is_empty() && !children.iter().any(|c| c == child) {
                children.push(child.to_string());
            }
        }
        Some(children)
    }

    fn send(&self, mut message: Message) -> Option<u32> {
        if !self.connected.get() || self.bus.take_fault(Fault::Send) {
            return None;
        }

        let serial = self.next_serial.get();
        self.next_serial.set(serial.wrapping_add(1).max(1));
        message.serial = serial;
        message.sender = Some(self.unique_name.clone());

        if message.expects_reply() {
            self.awaiting_reply.borrow_mut().push(serial);
            self.set_timeout_enabled(true);
        }

        tracing::trace!(
            connection = %self.id,
            serial,
            kind = ?message.kind,
            member = ?message.member,
            "message queued"
        );
        self.outgoing.borrow_mut().push_back(message);
        self.set_write_enabled(true);
        self.wake();
        Some(serial)
    }

    fn close(&self) {
        if !self.connected.get() {
            return;
        }
        self.notify_peer_closed();
        self.lose_connection();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.connected.get() {
            self.notify_peer_closed();
        }
        if let Some(hooks) = self.watch_hooks.get_mut().take() {
            for watch in self.watches() {
                hooks.remove_watch(&watch);
            }
        }
        if let Some(hooks) = self.timeout_hooks.get_mut().take() {
            hooks.remove_timeout(&self.timeout_ref());
        }
    }
}
