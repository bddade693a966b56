//! Well-known bus names.
//!
//! Interface names, object paths and error names that both ends of a bus
//! connection agree on.  These are part of the protocol, not of any one
//! implementation.

/// Interface of signals synthesized locally by the bus library.
pub const INTERFACE_LOCAL: &str = "org.freedesktop.DBus.Local";

/// Object path of signals synthesized locally by the bus library.
pub const PATH_LOCAL: &str = "/org/freedesktop/DBus/Local";

/// Member name of the local signal emitted when a connection is lost.
pub const SIGNAL_DISCONNECTED: &str = "Disconnected";

/// Standard introspection interface.
pub const INTERFACE_INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// Standard properties interface.
pub const INTERFACE_PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// Document type declaration that opens every introspection document.
pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

// ---------------------------------------------------------------------------
// Error names
// ---------------------------------------------------------------------------

/// Generic failure.
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// Allocation or resource exhaustion.
pub const ERROR_NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";

/// Nothing is listening at the requested address.
pub const ERROR_NO_SERVER: &str = "org.freedesktop.DBus.Error.NoServer";

/// The address string is malformed.
pub const ERROR_BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";

/// Something is already listening at the requested address.
pub const ERROR_ADDRESS_IN_USE: &str = "org.freedesktop.DBus.Error.AddressInUse";

/// The connection has been closed.
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

/// A method call received no reply in time.
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Arguments of a method call were invalid.
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// No handler exists for the called method.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// An object is already registered at the path.
pub const ERROR_OBJECT_PATH_IN_USE: &str = "org.freedesktop.DBus.Error.ObjectPathInUse";
