//! Firefly payload encoding.
//!
//! A firefly is a JSON document following the scitags Firefly v1 layout.
//! Serialization order follows struct field order, which is what collectors
//! expect: `version`, `flow-lifecycle`, `flow-id`, `context` and, only when
//! enrichment succeeded, `netlink`.

use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use flowd_common::{FlowId, FlowState};
use serde::Serialize;
use thiserror::Error;

use crate::netlink::NetlinkContext;

pub const FIREFLY_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("source {src} and destination {dst} belong to different address families")]
    AddressFamilyMismatch { src: IpAddr, dst: IpAddr },

    #[error("destination address {0} is unspecified")]
    UnspecifiedDestination(IpAddr),

    #[error("flow ends at {end} before it starts at {start}")]
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("failed to serialize firefly: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct Firefly<'a> {
    version: u8,
    #[serde(rename = "flow-lifecycle")]
    flow_lifecycle: FlowLifecycle,
    #[serde(rename = "flow-id")]
    flow_id: FireflyFlowId,
    context: Context<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    netlink: Option<&'a NetlinkContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct FlowLifecycle {
    state: FlowState,
    current_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct FireflyFlowId {
    afi: &'static str,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    protocol: &'static str,
    src_port: u16,
    dst_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Context<'a> {
    experiment_id: u32,
    activity_id: u32,
    application: &'a str,
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds firefly payloads on behalf of one application.
#[derive(Debug, Clone)]
pub struct FireflyEncoder {
    application: String,
}

impl Default for FireflyEncoder {
    fn default() -> Self {
        Self::new(format!("flowd v{}", env!("CARGO_PKG_VERSION")))
    }
}

impl FireflyEncoder {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Encodes `flow` as observed at `now`. `netlink` is included verbatim
    /// when present and omitted otherwise.
    pub fn encode(
        &self,
        flow: &FlowId,
        netlink: Option<&NetlinkContext>,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, EncodeError> {
        validate(flow)?;

        let firefly = Firefly {
            version: FIREFLY_VERSION,
            flow_lifecycle: FlowLifecycle {
                state: flow.state,
                current_time: rfc3339(now),
                start_time: flow.start_ts.map(rfc3339),
                end_time: flow.end_ts.map(rfc3339),
            },
            flow_id: FireflyFlowId {
                afi: if flow.is_ipv6() { "ipv6" } else { "ipv4" },
                src_ip: flow.src.ip(),
                dst_ip: flow.dst.ip(),
                protocol: flow.protocol.as_str(),
                src_port: flow.src.port(),
                dst_port: flow.dst.port(),
            },
            context: Context {
                experiment_id: flow.experiment_id,
                activity_id: flow.activity_id,
                application: &self.application,
            },
            netlink,
        };

        Ok(serde_json::to_vec(&firefly)?)
    }
}

fn validate(flow: &FlowId) -> Result<(), EncodeError> {
    let (src, dst) = (flow.src.ip(), flow.dst.ip());
    if src.is_ipv6() != dst.is_ipv6() {
        return Err(EncodeError::AddressFamilyMismatch { src, dst });
    }
    if dst.is_unspecified() {
        return Err(EncodeError::UnspecifiedDestination(dst));
    }
    if let (Some(start), Some(end)) = (flow.start_ts, flow.end_ts) {
        if end < start {
            return Err(EncodeError::EndBeforeStart { start, end });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use flowd_common::Protocol;
    use serde_json::Value;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap()
    }

    fn flow(line: &str) -> FlowId {
        line.parse().expect("test flow should parse")
    }

    #[test]
    fn encodes_fields_in_firefly_order() {
        let encoder = FireflyEncoder::new("flowd test");
        let flow = flow("start tcp 2001:db8::1 2345 2001:db8::2 443 42 7").stamp(now());

        let bytes = encoder.encode(&flow, None, now()).expect("should encode");
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(
            text,
            concat!(
                r#"{"version":1,"#,
                r#""flow-lifecycle":{"state":"start","current-time":"2024-03-14T15:09:26Z","start-time":"2024-03-14T15:09:26Z"},"#,
                r#""flow-id":{"afi":"ipv6","src-ip":"2001:db8::1","dst-ip":"2001:db8::2","protocol":"tcp","src-port":2345,"dst-port":443},"#,
                r#""context":{"experiment-id":42,"activity-id":7,"application":"flowd test"}}"#
            )
        );
    }

    #[test]
    fn includes_netlink_context_when_present() {
        let encoder = FireflyEncoder::default();
        let flow = flow("ongoing udp 10.0.0.1 5000 10.0.0.2 5001 1 1");
        let ctx = NetlinkContext {
            interface: Some("eth0".into()),
            ifindex: 2,
            mtu: Some(1500),
            gateway: Some("10.0.0.254".parse().unwrap()),
            pref_src: Some("10.0.0.1".parse().unwrap()),
        };

        let bytes = encoder.encode(&flow, Some(&ctx), now()).unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(doc["netlink"]["interface"], "eth0");
        assert_eq!(doc["netlink"]["ifindex"], 2);
        assert_eq!(doc["netlink"]["mtu"], 1500);
        assert_eq!(doc["netlink"]["gateway"], "10.0.0.254");
        assert_eq!(doc["netlink"]["pref-src"], "10.0.0.1");
        assert_eq!(doc["flow-id"]["afi"], "ipv4");
        assert_eq!(doc["flow-id"]["protocol"], "udp");
        assert!(doc["flow-lifecycle"].get("start-time").is_none());
    }

    #[test]
    fn end_event_carries_both_timestamps() {
        let encoder = FireflyEncoder::default();
        let start = Utc.with_ymd_and_hms(2024, 3, 14, 15, 0, 0).unwrap();
        let mut flow = flow("end tcp 10.0.0.1 1 10.0.0.2 2 3 4").stamp(now());
        flow.start_ts = Some(start);

        let doc: Value = serde_json::from_slice(&encoder.encode(&flow, None, now()).unwrap()).unwrap();
        assert_eq!(doc["flow-lifecycle"]["state"], "end");
        assert_eq!(doc["flow-lifecycle"]["start-time"], "2024-03-14T15:00:00Z");
        assert_eq!(doc["flow-lifecycle"]["end-time"], "2024-03-14T15:09:26Z");
    }

    #[test]
    fn rejects_mixed_address_families() {
        let encoder = FireflyEncoder::default();
        let mut flow = flow("start tcp 10.0.0.1 1 10.0.0.2 2 1 1");
        flow.dst = "[2001:db8::2]:2".parse().unwrap();

        assert!(matches!(
            encoder.encode(&flow, None, now()),
            Err(EncodeError::AddressFamilyMismatch { .. })
        ));
    }

    #[test]
    fn rejects_unspecified_destination() {
        let encoder = FireflyEncoder::default();
        let flow = flow("start tcp 10.0.0.1 1 0.0.0.0 2 1 1");

        assert!(matches!(
            encoder.encode(&flow, None, now()),
            Err(EncodeError::UnspecifiedDestination(_))
        ));
    }

    #[test]
    fn rejects_end_before_start() {
        let encoder = FireflyEncoder::default();
        let mut flow = FlowId::new(
            FlowState::End,
            Protocol::Tcp,
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            1,
            1,
        );
        flow.start_ts = Some(now());
        flow.end_ts = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        assert!(matches!(
            encoder.encode(&flow, None, now()),
            Err(EncodeError::EndBeforeStart { .. })
        ));
    }

    #[test]
    fn default_application_names_flowd() {
        assert!(FireflyEncoder::default().application().starts_with("flowd v"));
    }
}
