//! Bus message model.
//!
//! A [`Message`] carries the header fields that routing and dispatch look at
//! (type, serials, path, interface, member, error name) plus a body of typed
//! [`Value`]s.  Encoding to and from the wire is the transport's business;
//! everything above the transport sees only this structure.

use serde::{Deserialize, Serialize};

use crate::names;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The four kinds of bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A request to invoke a method on an object.
    MethodCall,
    /// A successful reply to a method call.
    MethodReturn,
    /// An error reply to a method call.
    Error,
    /// A broadcast notification emitted by an object.
    Signal,
}

/// A single typed body argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    ObjectPath(String),
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Array(Vec<Value>),
}

impl Value {
    /// Borrow the contained string for `String` and `ObjectPath` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    /// The single-character type signature of this value.
    pub fn signature(&self) -> String {
        match self {
            Self::String(_) => "s".into(),
            Self::ObjectPath(_) => "o".into(),
            Self::Bool(_) => "b".into(),
            Self::Int32(_) => "i".into(),
            Self::UInt32(_) => "u".into(),
            Self::Array(items) => {
                let inner = items.first().map_or_else(|| "v".to_string(), Value::signature);
                format!("a{inner}")
            }
        }
    }
}

/// Outcome reported by filters and object handlers for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerResult {
    /// The message was consumed; no further handlers see it.
    Handled,
    /// The message was not consumed; later handlers (or the bus library's
    /// default behaviour) should get a chance at it.
    NotYetHandled,
    /// Handling failed for lack of resources; the message should be retried.
    NeedMemory,
}

/// Result of one dispatch step on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchStatus {
    /// More messages are queued for dispatch.
    DataRemains,
    /// The dispatch queue is empty.
    Complete,
    /// Dispatch could not proceed for lack of resources.
    NeedMemory,
}

/// A bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageType,
    /// Assigned by the connection when the message is sent; zero before.
    pub serial: u32,
    /// Serial of the call this message answers.
    pub reply_serial: Option<u32>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub sender: Option<String>,
    pub destination: Option<String>,
    /// Set on method calls whose caller does not want an answer.
    pub no_reply_expected: bool,
    pub body: Vec<Value>,
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            sender: None,
            destination: None,
            no_reply_expected: false,
            body: Vec::new(),
        }
    }

    /// Build a method call addressed to `interface.member` on `path`.
    pub fn method_call(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageType::MethodCall)
        }
    }

    /// Build a signal emitted from `path`.
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Self::empty(MessageType::Signal)
        }
    }

    /// Build the successful reply to `call`.
    pub fn method_return(call: &Message) -> Self {
        Self {
            reply_serial: Some(call.serial),
            destination: call.sender.clone(),
            ..Self::empty(MessageType::MethodReturn)
        }
    }

    /// Build an error reply to `call` carrying `name` and a text body.
    pub fn error_reply(call: &Message, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            destination: call.sender.clone(),
            ..Self::error(call.serial, name, text)
        }
    }

    /// Build an error answering the call with serial `reply_serial`.
    pub fn error(reply_serial: u32, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            reply_serial: Some(reply_serial),
            error_name: Some(name.into()),
            body: vec![Value::String(text.into())],
            ..Self::empty(MessageType::Error)
        }
    }

    /// The local signal the bus library delivers when a connection is lost.
    pub fn disconnected() -> Self {
        Self::signal(
            names::PATH_LOCAL,
            names::INTERFACE_LOCAL,
            names::SIGNAL_DISCONNECTED,
        )
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Append one argument to the body.
    #[must_use]
    pub fn with_arg(mut self, value: Value) -> Self {
        self.body.push(value);
        self
    }

    /// Mark a method call as not expecting a reply.
    #[must_use]
    pub fn without_reply(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    /// Whether this is a method call to exactly `interface.member`.
    pub fn is_method_call(&self, interface: &str, member: &str) -> bool {
        self.kind == MessageType::MethodCall && self.matches(interface, member)
    }

    /// Whether this is a signal named exactly `interface.member`.
    pub fn is_signal(&self, interface: &str, member: &str) -> bool {
        self.kind == MessageType::Signal && self.matches(interface, member)
    }

    /// Whether this is an error reply with the given name.
    pub fn is_error(&self, name: &str) -> bool {
        self.kind == MessageType::Error && self.error_name.as_deref() == Some(name)
    }

    /// Whether the message carries exactly `path`.
    pub fn has_path(&self, path: &str) -> bool {
        self.path.as_deref() == Some(path)
    }

    /// Whether the sender of this message is waiting for an answer.
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageType::MethodCall && !self.no_reply_expected
    }

    /// Type signature of the whole body.
    pub fn signature(&self) -> String {
        self.body.iter().map(Value::signature).collect()
    }

    fn matches(&self, interface: &str, member: &str) -> bool {
        self.interface.as_deref() == Some(interface) && self.member.as_deref() == Some(member)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
