//! Types shared between flowd components.
//!
//! A [`FlowId`] describes one monitored network flow together with its
//! lifecycle state and the experiment/activity it belongs to. Producers build
//! them, backends only read them.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FlowState {
    Start,
    Ongoing,
    End,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Start => "start",
            FlowState::Ongoing => "ongoing",
            FlowState::End => "end",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowState {
    type Err = ParseFlowIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(FlowState::Start),
            "ongoing" => Ok(FlowState::Ongoing),
            "end" => Ok(FlowState::End),
            other => Err(ParseFlowIdError::InvalidState(other.to_string())),
        }
    }
}

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[cfg_attr(feature = "serde", serde(rename = "ipv6-icmp"))]
    Icmpv6,
}

impl Protocol {
    /// IANA keyword for the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "ipv6-icmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ParseFlowIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "icmpv6" | "ipv6-icmp" => Ok(Protocol::Icmpv6),
            other => Err(ParseFlowIdError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Identifies one network flow and the activity it is tagged with.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowId {
    pub state: FlowState,
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub experiment_id: u32,
    pub activity_id: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub start_ts: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub end_ts: Option<DateTime<Utc>>,
}

impl FlowId {
    pub fn new(
        state: FlowState,
        protocol: Protocol,
        src: SocketAddr,
        dst: SocketAddr,
        experiment_id: u32,
        activity_id: u32,
    ) -> Self {
        Self {
            state,
            protocol,
            src,
            dst,
            experiment_id,
            activity_id,
            start_ts: None,
            end_ts: None,
        }
    }

    /// Records `now` as the start or end time, depending on the state.
    /// Ongoing flows are left untouched.
    pub fn stamp(mut self, now: DateTime<Utc>) -> Self {
        match self.state {
            FlowState::Start => self.start_ts = Some(now),
            FlowState::End => self.end_ts = Some(now),
            FlowState::Ongoing => {}
        }
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.dst.is_ipv6()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} [{}/{}]",
            self.state, self.protocol, self.src, self.dst, self.experiment_id, self.activity_id
        )
    }
}

/// Errors produced while parsing the line representation of a [`FlowId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseFlowIdError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("invalid flow state '{0}'")]
    InvalidState(String),

    #[error("invalid protocol '{0}'")]
    InvalidProtocol(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid {field} '{value}'")]
    InvalidId { field: &'static str, value: String },
}

const LINE_FIELDS: usize = 8;

/// Parses `<state> <proto> <src-ip> <src-port> <dst-ip> <dst-port> <exp-id> <act-id>`.
impl FromStr for FlowId {
    type Err = ParseFlowIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != LINE_FIELDS {
            return Err(ParseFlowIdError::FieldCount {
                expected: LINE_FIELDS,
                got: fields.len(),
            });
        }

        let state = fields[0].parse()?;
        let protocol = fields[1].parse()?;
        let src = SocketAddr::new(parse_addr(fields[2])?, parse_port(fields[3])?);
        let dst = SocketAddr::new(parse_addr(fields[4])?, parse_port(fields[5])?);
        let experiment_id = parse_id("experiment id", fields[6])?;
        let activity_id = parse_id("activity id", fields[7])?;

        Ok(FlowId::new(
            state,
            protocol,
            src,
            dst,
            experiment_id,
            activity_id,
        ))
    }
}

fn parse_addr(s: &str) -> Result<IpAddr, ParseFlowIdError> {
    s.parse()
        .map_err(|_| ParseFlowIdError::InvalidAddress(s.to_string()))
}

fn parse_port(s: &str) -> Result<u16, ParseFlowIdError> {
    s.parse()
        .map_err(|_| ParseFlowIdError::InvalidPort(s.to_string()))
}

fn parse_id(field: &'static str, s: &str) -> Result<u32, ParseFlowIdError> {
    s.parse().map_err(|_| ParseFlowIdError::InvalidId {
        field,
        value: s.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_ipv6_line() {
        let flow: FlowId = "start tcp 2001:db8::1 2345 2001:db8::2 443 42 7"
            .parse()
            .expect("line should parse");

        assert_eq!(flow.state, FlowState::Start);
        assert_eq!(flow.protocol, Protocol::Tcp);
        assert_eq!(
            flow.src,
            SocketAddr::new(IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap()), 2345)
        );
        assert_eq!(flow.dst.port(), 443);
        assert_eq!(flow.experiment_id, 42);
        assert_eq!(flow.activity_id, 7);
        assert!(flow.is_ipv6());
        assert_eq!(flow.start_ts, None);
    }

    #[test]
    fn parses_ipv4_line_case_insensitively() {
        let flow: FlowId = "END UDP 10.0.0.1 53 10.0.0.2 5353 1 2".parse().unwrap();
        assert_eq!(flow.state, FlowState::End);
        assert_eq!(flow.protocol, Protocol::Udp);
        assert_eq!(flow.src.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!flow.is_ipv6());
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = "start tcp 10.0.0.1 53".parse::<FlowId>().unwrap_err();
        assert_eq!(
            err,
            ParseFlowIdError::FieldCount {
                expected: 8,
                got: 4
            }
        );
    }

    #[test]
    fn rejects_bad_fields() {
        assert_eq!(
            "begin tcp 10.0.0.1 1 10.0.0.2 2 1 1".parse::<FlowId>().unwrap_err(),
            ParseFlowIdError::InvalidState("begin".into())
        );
        assert_eq!(
            "start sctp 10.0.0.1 1 10.0.0.2 2 1 1".parse::<FlowId>().unwrap_err(),
            ParseFlowIdError::InvalidProtocol("sctp".into())
        );
        assert_eq!(
            "start tcp 10.0.0.300 1 10.0.0.2 2 1 1".parse::<FlowId>().unwrap_err(),
            ParseFlowIdError::InvalidAddress("10.0.0.300".into())
        );
        assert_eq!(
            "start tcp 10.0.0.1 70000 10.0.0.2 2 1 1".parse::<FlowId>().unwrap_err(),
            ParseFlowIdError::InvalidPort("70000".into())
        );
        assert!(matches!(
            "start tcp 10.0.0.1 1 10.0.0.2 2 x 1".parse::<FlowId>().unwrap_err(),
            ParseFlowIdError::InvalidId { field: "experiment id", .. }
        ));
    }

    #[test]
    fn stamp_sets_timestamp_matching_state() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let start: FlowId = "start tcp 10.0.0.1 1 10.0.0.2 2 1 1".parse().unwrap();
        let end: FlowId = "end tcp 10.0.0.1 1 10.0.0.2 2 1 1".parse().unwrap();
        let ongoing: FlowId = "ongoing tcp 10.0.0.1 1 10.0.0.2 2 1 1".parse().unwrap();

        assert_eq!(start.stamp(now).start_ts, Some(now));
        let end = end.stamp(now);
        assert_eq!(end.end_ts, Some(now));
        assert_eq!(end.start_ts, None);
        let ongoing = ongoing.stamp(now);
        assert_eq!((ongoing.start_ts, ongoing.end_ts), (None, None));
    }

    #[test]
    fn protocol_names_follow_iana_keywords() {
        assert_eq!(Protocol::Icmpv6.to_string(), "ipv6-icmp");
        assert_eq!("icmpv6".parse::<Protocol>().unwrap(), Protocol::Icmpv6);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_names_match_display() {
        assert_eq!(
            serde_json::to_string(&Protocol::Icmpv6).unwrap(),
            "\"ipv6-icmp\""
        );
        assert_eq!(serde_json::to_string(&FlowState::Ongoing).unwrap(), "\"ongoing\"");
    }
}
