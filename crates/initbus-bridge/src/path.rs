//! Object path construction.
//!
//! Bus object paths only admit `[A-Za-z0-9_]` between separators, so
//! arbitrary names (job names, instance names) are escaped before use: every
//! byte outside `[A-Za-z0-9]` becomes `_` followed by two lowercase hex
//! digits.  The root is trusted and copied verbatim.
//!
//! # Example
//!
//! ```rust
//! use initbus_bridge::path::{build_path, decode_path_component};
//!
//! let path = build_path("/com/ubuntu/Upstart/jobs", &["dbus-daemon", "tty 1"]);
//! assert_eq!(path, "/com/ubuntu/Upstart/jobs/dbus_2ddaemon/tty_201");
//! assert_eq!(decode_path_component("tty_201").as_deref(), Some(&b"tty 1"[..]));
//! ```

const HEX: &[u8; 16] = b"0123456789abcdef";

fn escaped_len(byte: u8) -> usize {
    if byte.is_ascii_alphanumeric() { 1 } else { 3 }
}

/// Join `root` and the escaped `components` with `/`.
pub fn build_path<C: AsRef<[u8]>>(root: &str, components: &[C]) -> String {
    let len = root.len()
        + components
            .iter()
            .map(|c| 1 + c.as_ref().iter().copied().map(escaped_len).sum::<usize>())
            .sum::<usize>();

    let mut path = String::with_capacity(len);
    path.push_str(root);
    for component in components {
        path.push('/');
        for &byte in component.as_ref() {
            if byte.is_ascii_alphanumeric() {
                path.push(char::from(byte));
            } else {
                path.push('_');
                path.push(char::from(HEX[usize::from(byte >> 4)]));
                path.push(char::from(HEX[usize::from(byte & 0x0f)]));
            }
        }
    }

    debug_assert_eq!(path.len(), len);
    path
}

/// Reverse the escaping of one path component.
///
/// Returns `None` if the component contains a byte that escaping never
/// produces, or a `_` not followed by two lowercase hex digits.
pub fn decode_path_component(component: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(component.len());
    let mut bytes = component.bytes();
    while let Some(byte) = bytes.next() {
        match byte {
            b'_' => {
                let hi = hex_value(bytes.next()?)?;
                let lo = hex_value(bytes.next()?)?;
                out.push((hi << 4) | lo);
            }
            b if b.is_ascii_alphanumeric() => out.push(b),
            _ => return None,
        }
    }
    Some(out)
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        _ => None,
    }
}
