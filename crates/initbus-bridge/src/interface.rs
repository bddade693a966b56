//! Static interface descriptions.
//!
//! An exported object is described by a list of [`Interface`]s, each naming
//! its methods, signals and properties.  Descriptions are plain `'static`
//! data, normally written out as constants next to the marshallers they
//! reference:
//!
//! ```rust
//! use initbus_bridge::interface::{Arg, Interface, Method};
//! use initbus_bridge::{MethodCall, Object};
//! use initbus_transport::HandlerResult;
//!
//! fn ping(_object: &Object, call: &MethodCall<'_>) -> HandlerResult {
//!     call.respond(Vec::new())
//! }
//!
//! const PING_ARGS: &[Arg] = &[];
//! const METHODS: &[Method] = &[Method::new("Ping", PING_ARGS, ping)];
//! pub const PINGER: Interface = Interface::new("com.example.Pinger", METHODS, &[], &[]);
//! ```

use std::fmt;

use initbus_transport::HandlerResult;
use serde::{Deserialize, Serialize};

use crate::dispatch::MethodCall;
use crate::object::Object;

/// Decodes a method call, runs the handler and sends the reply.
pub type Marshaller = fn(&Object, &MethodCall<'_>) -> HandlerResult;

/// Direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgDirection {
    In,
    Out,
}

impl ArgDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    #[serde(rename = "readwrite")]
    ReadWrite,
}

impl Access {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "readwrite",
        }
    }
}

/// One argument of a method or signal.
///
/// Signal arguments carry a direction too but it is never rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arg {
    pub name: &'static str,
    /// Type signature, e.g. `s` or `a{sv}`.
    pub signature: &'static str,
    pub direction: ArgDirection,
}

impl Arg {
    pub const fn input(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            direction: ArgDirection::In,
        }
    }

    pub const fn output(name: &'static str, signature: &'static str) -> Self {
        Self {
            name,
            signature,
            direction: ArgDirection::Out,
        }
    }
}

/// A method and the marshaller handling calls to it.
#[derive(Clone, Copy)]
pub struct Method {
    pub name: &'static str,
    pub args: &'static [Arg],
    pub marshaller: Marshaller,
}

impl Method {
    pub const fn new(name: &'static str, args: &'static [Arg], marshaller: Marshaller) -> Self {
        Self {
            name,
            args,
            marshaller,
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub name: &'static str,
    pub args: &'static [Arg],
}

impl Signal {
    pub const fn new(name: &'static str, args: &'static [Arg]) -> Self {
        Self { name, args }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub name: &'static str,
    pub signature: &'static str,
    pub access: Access,
}

impl Property {
    pub const fn new(name: &'static str, signature: &'static str, access: Access) -> Self {
        Self {
            name,
            signature,
            access,
        }
    }
}

/// A named interface: methods, signals and properties, each in the order
/// they are dispatched and introspected.
#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub name: &'static str,
    pub methods: &'static [Method],
    pub signals: &'static [Signal],
    pub properties: &'static [Property],
}

impl Interface {
    pub const fn new(
        name: &'static str,
        methods: &'static [Method],
        signals: &'static [Signal],
        properties: &'static [Property],
    ) -> Self {
        Self {
            name,
            methods,
            signals,
            properties,
        }
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhandled(_object: &Object, _call: &MethodCall<'_>) -> HandlerResult {
        HandlerResult::NotYetHandled
    }

    const START_ARGS: &[Arg] = &[Arg::input("name", "s"), Arg::output("instance", "o")];
    const METHODS: &[Method] = &[
        Method::new("Start", START_ARGS, unhandled),
        Method::new("Stop", &[], unhandled),
    ];
    const PROPERTIES: &[Property] = &[Property::new("name", "s", Access::Read)];
    const JOB: Interface = Interface::new("com.example.Job", METHODS, &[], PROPERTIES);

    #[test]
    fn methods_are_found_by_name() {
        assert_eq!(JOB.method("Start").map(|m| m.args.len()), Some(2));
        assert!(JOB.method("Restart").is_none());
        assert!(JOB.has_properties());
    }

    #[test]
    fn rendered_names() {
        assert_eq!(ArgDirection::Out.as_str(), "out");
        assert_eq!(Access::ReadWrite.as_str(), "readwrite");
        assert_eq!(START_ARGS[0].direction, ArgDirection::In);
    }
}
