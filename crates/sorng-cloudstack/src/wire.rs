//! Wire tracing.
//!
//! The transport and the XML parser report what goes over the wire to an
//! optional observer held by the client. No observer means no tracing.

use std::collections::BTreeMap;

/// Log target used by [`LogWire`].
pub const WIRE_TARGET: &str = "sorng_cloudstack::wire";

/// Receives request/response traffic for diagnostics.
pub trait WireObserver: Send + Sync {
    /// Called before the request is sent.
    fn request(&self, method: &str, url: &str, headers: &[(&str, &str)]);

    /// Called once the status line and headers are in.
    fn response(&self, status: u16, headers: &BTreeMap<String, String>);

    /// Called with the response body, pretty-printed when it parsed as XML.
    fn body(&self, payload: &str);
}

/// Observer that writes traffic through `log::debug!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogWire;

impl WireObserver for LogWire {
    fn request(&self, method: &str, url: &str, headers: &[(&str, &str)]) {
        log::debug!(target: WIRE_TARGET, "--------------------------------------------------------------");
        log::debug!(target: WIRE_TARGET, "{} {} HTTP/1.1", method, url);
        for (name, value) in headers {
            log::debug!(target: WIRE_TARGET, "{}: {}", name, value);
        }
    }

    fn response(&self, status: u16, headers: &BTreeMap<String, String>) {
        log::debug!(target: WIRE_TARGET, "HTTP/1.1 {}", status);
        for (name, value) in headers {
            log::debug!(target: WIRE_TARGET, "{}: {}", name, value);
        }
    }

    fn body(&self, payload: &str) {
        log::debug!(target: WIRE_TARGET, "{}", payload);
    }
}
