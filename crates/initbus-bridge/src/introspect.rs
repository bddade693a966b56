//! Introspection documents generated from interface tables.
//!
//! The document lists, in order: the standard `Introspectable` interface,
//! every interface of the object as declared, the standard `Properties`
//! interface if any declared interface has properties, and one empty
//! `<node>` per child path registered directly below the object.

use std::fmt;

use initbus_transport::{ConnectionRef, HandlerResult, Message, Value, names};

use crate::interface::{Arg, Interface};
use crate::object::Object;

/// Renders one introspection document.
pub struct Introspection<'a> {
    pub path: &'a str,
    pub interfaces: &'a [&'a Interface],
    pub children: &'a [String],
}

impl Introspection<'_> {
    fn has_properties(&self) -> bool {
        self.interfaces.iter().any(|i| i.has_properties())
    }
}

impl fmt::Display for Introspection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(names::INTROSPECT_DOCTYPE)?;
        writeln!(f, "<node name=\"{}\">", self.path)?;

        writeln!(f, "  <interface name=\"{}\">", names::INTERFACE_INTROSPECTABLE)?;
        writeln!(f, "    <method name=\"Introspect\">")?;
        writeln!(f, "      <arg name=\"data\" type=\"s\" direction=\"out\"/>")?;
        writeln!(f, "    </method>")?;
        writeln!(f, "  </interface>")?;

        for interface in self.interfaces {
            write_interface(f, interface)?;
        }

        if self.has_properties() {
            write_properties_interface(f)?;
        }

        for child in self.children {
            writeln!(f, "  <node name=\"{child}\"/>")?;
        }

        writeln!(f, "</node>")
    }
}

fn write_interface(f: &mut fmt::Formatter<'_>, interface: &Interface) -> fmt::Result {
    writeln!(f, "  <interface name=\"{}\">", interface.name)?;

    for method in interface.methods {
        writeln!(f, "    <method name=\"{}\">", method.name)?;
        for arg in method.args {
            writeln!(
                f,
                "      <arg name=\"{}\" type=\"{}\" direction=\"{}\"/>",
                arg.name,
                arg.signature,
                arg.direction.as_str()
            )?;
        }
        writeln!(f, "    </method>")?;
    }

    for signal in interface.signals {
        writeln!(f, "    <signal name=\"{}\">", signal.name)?;
        for arg in signal.args {
            writeln!(f, "      <arg name=\"{}\" type=\"{}\"/>", arg.name, arg.signature)?;
        }
        writeln!(f, "    </signal>")?;
    }

    for property in interface.properties {
        writeln!(
            f,
            "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
            property.name,
            property.signature,
            property.access.as_str()
        )?;
    }

    writeln!(f, "  </interface>")
}

const PROPERTIES_METHODS: &[(&str, &[Arg])] = &[
    (
        "Get",
        &[
            Arg::input("interface_name", "s"),
            Arg::input("property_name", "s"),
            Arg::output("value", "v"),
        ],
    ),
    (
        "Set",
        &[
            Arg::input("interface_name", "s"),
            Arg::input("property_name", "s"),
            Arg::input("value", "v"),
        ],
    ),
    (
        "GetAll",
        &[
            Arg::input("interface_name", "s"),
            Arg::output("props", "a{sv}"),
        ],
    ),
];

fn write_properties_interface(f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "  <interface name=\"{}\">", names::INTERFACE_PROPERTIES)?;
    for (name, args) in PROPERTIES_METHODS {
        writeln!(f, "    <method name=\"{name}\">")?;
        for arg in *args {
            writeln!(
                f,
                "      <arg name=\"{}\" type=\"{}\" direction=\"{}\"/>",
                arg.name,
                arg.signature,
                arg.direction.as_str()
            )?;
        }
        writeln!(f, "    </method>")?;
    }
    writeln!(f, "  </interface>")
}

/// The introspection document of `object`, or `None` if its children
/// could not be listed.
pub fn generate(connection: &ConnectionRef, object: &Object) -> Option<String> {
    let children = connection.list_registered(object.path())?;
    let document = Introspection {
        path: object.path(),
        interfaces: object.interfaces(),
        children: &children,
    };
    Some(document.to_string())
}

/// Answer an `Introspect` call on `object`.
pub fn introspect(connection: &ConnectionRef, message: &Message, object: &Object) -> HandlerResult {
    let Some(xml) = generate(connection, object) else {
        tracing::warn!(path = %object.path(), "failed to list children for introspection");
        return HandlerResult::NeedMemory;
    };

    let reply = Message::method_return(message).with_arg(Value::String(xml));
    if connection.send(reply).is_none() {
        tracing::warn!(path = %object.path(), "failed to send introspection reply");
        return HandlerResult::NeedMemory;
    }

    tracing::trace!(path = %object.path(), "introspection sent");
    HandlerResult::Handled
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
