//! RFC 5424 envelope for fireflies.
//!
//! Collectors fed through a syslog relay expect each datagram to start with a
//! header like `<134>1 2024-03-14T15:09:26Z host flowd - firefly-json - `.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

/// Facility `local0`.
pub const DEFAULT_FACILITY: u8 = 16;
/// Severity `informational`.
pub const DEFAULT_SEVERITY: u8 = 6;
pub const APP_NAME: &str = "flowd";
pub const MSG_ID: &str = "firefly-json";
/// RFC 5424 NILVALUE.
const NIL: &str = "-";

#[derive(Debug, Clone)]
pub struct SyslogWrapper {
    enabled: bool,
    hostname: String,
    facility: u8,
    severity: u8,
}

impl SyslogWrapper {
    /// Builds a wrapper using the local hostname.
    pub fn new(enabled: bool) -> Self {
        Self::with_hostname(enabled, local_hostname())
    }

    pub fn with_hostname(enabled: bool, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            enabled,
            hostname: if hostname.is_empty() {
                NIL.to_string()
            } else {
                hostname
            },
            facility: DEFAULT_FACILITY,
            severity: DEFAULT_SEVERITY,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn priority(&self) -> u8 {
        self.facility * 8 + self.severity
    }

    pub fn header(&self, now: DateTime<Utc>) -> String {
        format!(
            "<{}>1 {} {} {APP_NAME} {NIL} {MSG_ID} {NIL} ",
            self.priority(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.hostname,
        )
    }

    /// Prefixes `payload` with the header when enabled, hands it back
    /// untouched otherwise.
    pub fn wrap(&self, payload: Vec<u8>, now: DateTime<Utc>) -> Vec<u8> {
        if !self.enabled {
            return payload;
        }

        let header = self.header(now);
        let mut wrapped = Vec::with_capacity(header.len() + payload.len());
        wrapped.extend_from_slice(header.as_bytes());
        wrapped.extend_from_slice(&payload);
        wrapped
    }
}

fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(
                event.name = "firefly.syslog.hostname_unavailable",
                error.message = %e,
                "could not resolve local hostname, using nil value in syslog header"
            );
            NIL.to_string()
        }
    }
}
