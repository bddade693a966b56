//! Method-call dispatch for exported objects.
//!
//! Every message the connection routes to an object's path lands in
//! [`dispatch`]:
//!
//! 1. `Introspectable.Introspect` is answered from the object's interface
//!    table.
//! 2. `Properties.Get`, `Set` and `GetAll` are left unhandled.
//! 3. Anything else is matched against the object's interfaces in order,
//!    and each interface's methods in order.  The first exact
//!    `(interface, method)` match wins, so an interface listed earlier
//!    shadows a later one declaring the same method.

use initbus_transport::{ConnectionRef, HandlerResult, Message, Value, names};

use crate::error::{BridgeError, Result};
use crate::interface::{Interface, Method};
use crate::introspect;
use crate::object::Object;

const PROPERTY_METHODS: [&str; 3] = ["Get", "Set", "GetAll"];

/// Route `message` to `object`.
pub fn dispatch(connection: &ConnectionRef, message: &Message, object: &Object) -> HandlerResult {
    if message.is_method_call(names::INTERFACE_INTROSPECTABLE, "Introspect") {
        return introspect::introspect(connection, message, object);
    }

    if PROPERTY_METHODS
        .iter()
        .any(|member| message.is_method_call(names::INTERFACE_PROPERTIES, member))
    {
        tracing::trace!(path = %object.path(), member = ?message.member, "property access left unhandled");
        return HandlerResult::NotYetHandled;
    }

    let Some((interface, method)) = find_method(object.interfaces(), message) else {
        tracing::trace!(
            path = %object.path(),
            interface = ?message.interface,
            member = ?message.member,
            "no method matched"
        );
        return HandlerResult::NotYetHandled;
    };

    tracing::trace!(
        path = %object.path(),
        interface = %interface.name,
        method = %method.name,
        serial = message.serial,
        "dispatching method call"
    );
    let call = MethodCall::new(connection, message);
    (method.marshaller)(object, &call)
}

/// The first `(interface, method)` pair `message` calls, in table order.
pub fn find_method(
    interfaces: &'static [&'static Interface],
    message: &Message,
) -> Option<(&'static Interface, &'static Method)> {
    interfaces.iter().find_map(|&interface| {
        interface
            .methods
            .iter()
            .find(|method| message.is_method_call(interface.name, method.name))
            .map(|method| (interface, method))
    })
}

// ---------------------------------------------------------------------------
// MethodCall
// ---------------------------------------------------------------------------

/// One inbound method call and the connection it arrived on, handed to a
/// marshaller for the duration of the call.
pub struct MethodCall<'a> {
    connection: &'a ConnectionRef,
    message: &'a Message,
}

impl<'a> MethodCall<'a> {
    pub fn new(connection: &'a ConnectionRef, message: &'a Message) -> Self {
        Self {
            connection,
            message,
        }
    }

    pub fn connection(&self) -> &'a ConnectionRef {
        self.connection
    }

    pub fn message(&self) -> &'a Message {
        self.message
    }

    pub fn args(&self) -> &'a [Value] {
        &self.message.body
    }

    /// The string argument at `index`, or an `InvalidArgs` error.
    pub fn string_arg(&self, index: usize) -> Result<&'a str> {
        self.args()
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                crate::bus_error!(
                    names::ERROR_INVALID_ARGS,
                    "Invalid arguments to {} method",
                    self.message.member.as_deref().unwrap_or_default()
                )
            })
    }

    /// Send the method return carrying `body`.
    ///
    /// Nothing is sent if the caller asked for no reply.
    pub fn reply(&self, body: Vec<Value>) -> Result<()> {
        if !self.message.expects_reply() {
            return Ok(());
        }
        let reply = Message::method_return(self.message).with_body(body);
        self.send(reply)
    }

    /// Answer the call with `err`'s bus name and message.
    pub fn reply_error(&self, err: &BridgeError) -> Result<()> {
        if !self.message.expects_reply() {
            return Ok(());
        }
        tracing::debug!(serial = self.message.serial, error = %err, "replying with error");
        let reply = Message::error_reply(self.message, err.name(), err.message());
        self.send(reply)
    }

    /// [`reply`](Self::reply), folded into a handler result.
    pub fn respond(&self, body: Vec<Value>) -> HandlerResult {
        Self::handled(self.reply(body))
    }

    /// [`reply_error`](Self::reply_error), folded into a handler result.
    pub fn respond_error(&self, err: &BridgeError) -> HandlerResult {
        Self::handled(self.reply_error(err))
    }

    fn send(&self, message: Message) -> Result<()> {
        self.connection
            .send(message)
            .map(|_| ())
            .ok_or(BridgeError::NoMemory)
    }

    fn handled(sent: Result<()>) -> HandlerResult {
        match sent {
            Ok(()) => HandlerResult::Handled,
            Err(_) => HandlerResult::NeedMemory,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use initbus_transport::memory::{Fault, MemoryBus};

    use super::*;
    use crate::interface::{Access, Arg, Property};
    use crate::object::ExportedObject;

    fn first(_object: &Object, call: &MethodCall<'_>) -> HandlerResult {
        call.respond(vec![Value::String("first".to_string())])
    }

    fn second(_object: &Object, call: &MethodCall<'_>) -> HandlerResult {
        call.respond(vec![Value::String("second".to_string())])
    }

    fn echo(_object: &Object, call: &MethodCall<'_>) -> HandlerResult {
        match call.string_arg(0) {
            Ok(text) => call.respond(vec![Value::String(text.to_string())]),
            Err(e) => call.respond_error(&e),
        }
    }

    const ECHO_ARGS: &[Arg] = &[Arg::input("text", "s"), Arg::output("text", "s")];
    const SOURCE_ARGS: &[Arg] = &[Arg::output("source", "s")];
    const A_METHODS: &[Method] = &[
        Method::new("Echo", ECHO_ARGS, echo),
        Method::new("Which", &[], first),
    ];
    const B_METHODS: &[Method] = &[Method::new("Which", SOURCE_ARGS, second)];
    const PROPS: &[Property] = &[Property::new("name", "s", Access::Read)];
    const A: Interface = Interface::new("com.example.A", A_METHODS, &[], PROPS);
    const B: Interface = Interface::new("com.example.B", B_METHODS, &[], &[]);
    const SHADOW: Interface = Interface::new("com.example.A", B_METHODS, &[], &[]);

    static A_THEN_SHADOW: [&Interface; 2] = [&A, &SHADOW];
    static SHADOW_THEN_A: [&Interface; 2] = [&SHADOW, &A];
    static BOTH: [&Interface; 2] = [&A, &B];

    fn which(interface: &str) -> Message {
        let mut message = Message::method_call("/obj", interface, "Which");
        message.serial = 7;
        message
    }

    #[test]
    fn first_declared_interface_wins() {
        let found = find_method(&A_THEN_SHADOW, &which("com.example.A")).expect("matched");
        assert!(found.1.args.is_empty());

        let found = find_method(&SHADOW_THEN_A, &which("com.example.A")).expect("matched");
        assert_eq!(found.1.args, SOURCE_ARGS);

        let found = find_method(&BOTH, &which("com.example.B")).expect("matched");
        assert_eq!(found.0.name, "com.example.B");
        assert!(find_method(&BOTH, &which("com.example.C")).is_none());
    }

    #[test]
    fn signals_and_replies_are_not_dispatched() {
        let mut signal = Message::signal("/obj", "com.example.A", "Which");
        signal.serial = 3;
        assert!(find_method(&BOTH, &signal).is_none());
    }

    #[test]
    fn marshallers_reply_and_property_calls_fall_through() {
        let bus = MemoryBus::new();
        let _server = bus.bind("unix:abstract=dispatch").expect("listen");
        let concrete = bus.connect("unix:abstract=dispatch").expect("open");
        let connection: ConnectionRef = concrete.clone();
        let exported =
            ExportedObject::register(&connection, "/obj", &BOTH, None).expect("registered");

        let mut call = Message::method_call("/obj", "com.example.A", "Echo")
            .with_arg(Value::String("hi".to_string()));
        call.serial = 9;
        assert_eq!(dispatch(&connection, &call, &exported), HandlerResult::Handled);

        let mut bad = Message::method_call("/obj", "com.example.A", "Echo");
        bad.serial = 10;
        assert_eq!(dispatch(&connection, &bad, &exported), HandlerResult::Handled);

        let get = Message::method_call("/obj", names::INTERFACE_PROPERTIES, "Get");
        assert_eq!(dispatch(&connection, &get, &exported), HandlerResult::NotYetHandled);

        bus.fail_next(Fault::Send);
        assert_eq!(dispatch(&connection, &call, &exported), HandlerResult::NeedMemory);

        let quiet = call.clone().without_reply();
        assert_eq!(dispatch(&connection, &quiet, &exported), HandlerResult::Handled);
        assert_eq!(concrete.registered_paths(), vec!["/obj"]);
    }
}
