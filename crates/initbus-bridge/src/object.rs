//! Exported objects.
//!
//! [`ExportedObject::register`] places an [`Object`] at a path on a
//! connection.  The caller keeps the returned [`ExportedObject`] as the
//! owner; the connection keeps an [`ObjectEntry`] as the path's handler.
//! Either side can end the registration first:
//!
//! - dropping (or [`release`](ExportedObject::release)-ing) the owner
//!   unregisters the path from the connection;
//! - the connection unregistering the path, for instance because it was
//!   lost, drops the object's user data.
//!
//! The object's `registered` flag makes the two directions idempotent
//! against each other: whichever runs first clears it and the other does
//! nothing.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::{Rc, Weak};

use initbus_transport::{
    Connection, ConnectionRef, HandlerResult, Message, ObjectPathHandler, Value, names,
};

use crate::bus_error;
use crate::dispatch;
use crate::error::{BridgeError, Result};
use crate::interface::Interface;

/// An object exported on a bus connection.
pub struct Object {
    path: String,
    connection: Weak<dyn Connection>,
    interfaces: &'static [&'static Interface],
    data: RefCell<Option<Rc<dyn Any>>>,
    registered: Cell<bool>,
}

impl Object {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Interfaces in dispatch and introspection order.
    pub fn interfaces(&self) -> &'static [&'static Interface] {
        self.interfaces
    }

    /// The user data, if present and of type `T`.
    pub fn data<T: Any>(&self) -> Option<Rc<T>> {
        let data = self.data.borrow().clone()?;
        data.downcast::<T>().ok()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    /// The owning connection, unless it has already gone away.
    pub fn connection(&self) -> Option<ConnectionRef> {
        self.connection.upgrade()
    }

    /// Emit a signal from this object's path.
    pub fn emit_signal(&self, interface: &str, member: &str, body: Vec<Value>) -> Result<u32> {
        let connection = self.connection().ok_or_else(|| {
            bus_error!(
                names::ERROR_DISCONNECTED,
                "Connection of {} is gone",
                self.path
            )
        })?;

        let signal = Message::signal(self.path.as_str(), interface, member).with_body(body);
        let serial = connection.send(signal).ok_or(BridgeError::NoMemory)?;
        tracing::trace!(path = %self.path, interface = %interface, member = %member, serial, "signal emitted");
        Ok(serial)
    }

    /// Owner-driven end of the registration.
    fn release(&self) {
        if !self.registered.replace(false) {
            return;
        }
        tracing::debug!(path = %self.path, "releasing exported object");

        if let Some(connection) = self.connection() {
            connection.unregister_object_path(&self.path);
        }
        self.data.borrow_mut().take();
    }

    /// Bus-driven end of the registration.
    fn bus_unregister(&self) {
        if !self.registered.replace(false) {
            return;
        }
        tracing::debug!(path = %self.path, "object path unregistered by the bus");
        self.data.borrow_mut().take();
    }
}

// ---------------------------------------------------------------------------
// ExportedObject
// ---------------------------------------------------------------------------

/// Owner of a registered [`Object`].  Dropping it unregisters the path.
pub struct ExportedObject {
    object: Rc<Object>,
}

impl ExportedObject {
    /// Register `interfaces` at `path` on `connection`.
    ///
    /// On failure nothing stays registered and the error is always
    /// [`BridgeError::NoMemory`]; the bus's own error name is only logged.
    pub fn register(
        connection: &ConnectionRef,
        path: &str,
        interfaces: &'static [&'static Interface],
        data: Option<Rc<dyn Any>>,
    ) -> Result<Self> {
        let object = Rc::new(Object {
            path: path.to_string(),
            connection: Rc::downgrade(connection),
            interfaces,
            data: RefCell::new(data),
            registered: Cell::new(false),
        });

        let entry = Rc::new(ObjectEntry {
            object: Rc::clone(&object),
        });
        connection
            .register_object_path(path, entry)
            .map_err(|e| {
                tracing::warn!(
                    connection = %connection.id(),
                    path = %path,
                    bus_error = %e.name,
                    "failed to register object"
                );
                BridgeError::NoMemory
            })?;

        object.registered.set(true);
        tracing::debug!(
            connection = %connection.id(),
            path = %path,
            interfaces = interfaces.len(),
            "object registered"
        );
        Ok(Self { object })
    }

    /// Unregister the object now.
    pub fn release(self) {}

    pub fn object(&self) -> &Rc<Object> {
        &self.object
    }
}

impl Deref for ExportedObject {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

impl Drop for ExportedObject {
    fn drop(&mut self) {
        self.object.release();
    }
}

// ---------------------------------------------------------------------------
// ObjectEntry
// ---------------------------------------------------------------------------

/// The connection's handler for one exported object's path.
pub struct ObjectEntry {
    object: Rc<Object>,
}

impl ObjectEntry {
    pub fn object(&self) -> &Rc<Object> {
        &self.object
    }
}

impl ObjectPathHandler for ObjectEntry {
    fn unregister(&self, _connection: &ConnectionRef) {
        self.object.bus_unregister();
    }

    fn message(&self, connection: &ConnectionRef, message: &Message) -> HandlerResult {
        dispatch::dispatch(connection, message, &self.object)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
