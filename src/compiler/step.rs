//! Backend-agnostic compilation output.
//!
//! A [`CompiledRule`] is an ordered list of [`MatchStep`]s, the sets they reference,
//! an optional log statement and a verdict. Every [`Operand`] has exactly one byte
//! encoding, which is what the binary emitter loads into registers, and one textual
//! form, which is what the text emitter writes into the nft command.

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::util::MacAddr;
use std::fmt;
use std::net::Ipv4Addr;

use crate::utils::error::{FirewallError, FirewallResult};

/// Width of a kernel interface-name field (IFNAMSIZ)
pub const IFNAME_LEN: usize = 16;

/// Protocol names understood in policies and written in nft commands
pub(crate) const PROTOCOL_NAMES: [(IpNextHeaderProtocol, &str); 9] = [
    (IpNextHeaderProtocols::Icmp, "icmp"),
    (IpNextHeaderProtocols::Tcp, "tcp"),
    (IpNextHeaderProtocols::Udp, "udp"),
    (IpNextHeaderProtocols::Gre, "gre"),
    (IpNextHeaderProtocols::Esp, "esp"),
    (IpNextHeaderProtocols::Ah, "ah"),
    (IpNextHeaderProtocols::Icmpv6, "ipv6-icmp"),
    (IpNextHeaderProtocols::Sctp, "sctp"),
    (IpNextHeaderProtocols::UdpLite, "udplite"),
];

/// Packet field a step compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    InputInterface,
    OutputInterface,
    SourceAddress,
    DestAddress,
    Protocol,
    SourceMac,
    DestMac,
    SourcePort,
    DestPort,
    HourOfDay,
    Weekday,
    Timestamp,
}

impl Field {
    /// Kind of operand this field is compared with
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Field::InputInterface | Field::OutputInterface => OperandKind::Interface,
            Field::SourceAddress | Field::DestAddress => OperandKind::Ipv4,
            Field::Protocol => OperandKind::Protocol,
            Field::SourceMac | Field::DestMac => OperandKind::Mac,
            Field::SourcePort | Field::DestPort => OperandKind::Port,
            Field::HourOfDay => OperandKind::Hour,
            Field::Weekday => OperandKind::Weekday,
            Field::Timestamp => OperandKind::Timestamp,
        }
    }

    /// Base name of a set holding values of this field
    pub fn set_purpose(self) -> &'static str {
        match self {
            Field::InputInterface => "if_set",
            Field::OutputInterface => "of_set",
            Field::SourceAddress => "sip_set",
            Field::DestAddress => "dip_set",
            Field::Protocol => "proto_set",
            Field::SourceMac => "smac_set",
            Field::DestMac => "dmac_set",
            Field::SourcePort => "sport_set",
            Field::DestPort => "dport_set",
            Field::HourOfDay => "hour_set",
            Field::Weekday => "day_set",
            Field::Timestamp => "time_set",
        }
    }

    /// Left-hand side of the field in nft rule syntax
    pub fn nft_selector(self) -> &'static str {
        match self {
            Field::InputInterface => "iifname",
            Field::OutputInterface => "oifname",
            Field::SourceAddress => "ip saddr",
            Field::DestAddress => "ip daddr",
            Field::Protocol => "meta l4proto",
            Field::SourceMac => "ether saddr",
            Field::DestMac => "ether daddr",
            Field::SourcePort => "th sport",
            Field::DestPort => "th dport",
            Field::HourOfDay => "meta hour",
            Field::Weekday => "meta day",
            Field::Timestamp => "meta time",
        }
    }
}

/// Encoding class of an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Interface,
    Ipv4,
    Mac,
    Port,
    Protocol,
    Hour,
    Weekday,
    Timestamp,
}

impl OperandKind {
    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            OperandKind::Interface => IFNAME_LEN,
            OperandKind::Ipv4 => 4,
            OperandKind::Mac => 6,
            OperandKind::Port => 2,
            OperandKind::Protocol => 1,
            OperandKind::Hour => 4,
            OperandKind::Weekday => 1,
            OperandKind::Timestamp => 8,
        }
    }

    /// nft datatype id used as a set key type
    pub fn nft_datatype(self) -> u32 {
        match self {
            OperandKind::Ipv4 => 7,
            OperandKind::Mac => 9,
            OperandKind::Protocol => 12,
            OperandKind::Port => 13,
            OperandKind::Interface => 41,
            OperandKind::Timestamp => 43,
            OperandKind::Hour => 44,
            OperandKind::Weekday => 45,
        }
    }
}

/// Time of day as written in the policy plus its UTC equivalent.
///
/// The engine clock reports seconds since UTC midnight; nft command syntax takes the
/// local wall-clock time and converts it itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayTime {
    pub local: NaiveTime,
    pub utc_seconds: u32,
}

/// A value compared against a packet field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
    Interface(String),
    Ipv4(Ipv4Addr),
    Mac([u8; 6]),
    Port(u16),
    Protocol(u8),
    Hour(DayTime),
    Weekday(u8),
    Timestamp(DateTime<FixedOffset>),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Interface(_) => OperandKind::Interface,
            Operand::Ipv4(_) => OperandKind::Ipv4,
            Operand::Mac(_) => OperandKind::Mac,
            Operand::Port(_) => OperandKind::Port,
            Operand::Protocol(_) => OperandKind::Protocol,
            Operand::Hour(_) => OperandKind::Hour,
            Operand::Weekday(_) => OperandKind::Weekday,
            Operand::Timestamp(_) => OperandKind::Timestamp,
        }
    }

    /// Wire encoding, as compared in an engine register
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Operand::Interface(name) => {
                let mut buf = vec![0u8; IFNAME_LEN];
                let len = name.len().min(IFNAME_LEN - 1);
                buf[..len].copy_from_slice(&name.as_bytes()[..len]);
                buf
            }
            Operand::Ipv4(addr) => addr.octets().to_vec(),
            Operand::Mac(octets) => octets.to_vec(),
            Operand::Port(port) => port.to_be_bytes().to_vec(),
            Operand::Protocol(proto) => vec![*proto],
            Operand::Hour(t) => t.utc_seconds.to_be_bytes().to_vec(),
            Operand::Weekday(day) => vec![*day],
            Operand::Timestamp(ts) => {
                // Expansion only yields instants within the u64 nanosecond clock
                let nanos = ts.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
                nanos.to_be_bytes().to_vec()
            }
        }
    }

    /// Inverse of [`Operand::encode`].
    ///
    /// Hours and timestamps come back in UTC since the original offset is not encoded.
    pub fn decode(kind: OperandKind, bytes: &[u8]) -> FirewallResult<Operand> {
        if bytes.len() != kind.width() {
            return Err(FirewallError::parse(format!(
                "{:?} operand needs {} bytes, got {}",
                kind,
                kind.width(),
                bytes.len()
            )));
        }

        let operand = match kind {
            OperandKind::Interface => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                let name = std::str::from_utf8(&bytes[..end])
                    .map_err(|_| FirewallError::parse("interface name is not UTF-8"))?;
                Operand::Interface(name.to_string())
            }
            OperandKind::Ipv4 => Operand::Ipv4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            OperandKind::Mac => {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(bytes);
                Operand::Mac(octets)
            }
            OperandKind::Port => Operand::Port(u16::from_be_bytes([bytes[0], bytes[1]])),
            OperandKind::Protocol => Operand::Protocol(bytes[0]),
            OperandKind::Hour => {
                let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let local = NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
                    .ok_or_else(|| FirewallError::parse(format!("{} is not a time of day", secs)))?;
                Operand::Hour(DayTime {
                    local,
                    utc_seconds: secs,
                })
            }
            OperandKind::Weekday => Operand::Weekday(bytes[0]),
            OperandKind::Timestamp => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                let nanos = i64::try_from(u64::from_be_bytes(raw))
                    .map_err(|_| FirewallError::parse("timestamp out of range"))?;
                Operand::Timestamp(Utc.timestamp_nanos(nanos).with_timezone(&Utc.fix()))
            }
        };
        Ok(operand)
    }
}

/// Textual form as written in nft rule syntax
impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Interface(name) => write!(f, "\"{}\"", name),
            Operand::Ipv4(addr) => write!(f, "{}", addr),
            Operand::Mac(o) => write!(f, "{}", MacAddr::new(o[0], o[1], o[2], o[3], o[4], o[5])),
            Operand::Port(port) => write!(f, "{}", port),
            Operand::Protocol(proto) => match protocol_name(*proto) {
                Some(name) => f.write_str(name),
                None => write!(f, "{}", proto),
            },
            Operand::Hour(t) => write!(f, "\"{}\"", t.local.format("%H:%M:%S")),
            Operand::Weekday(day) => write!(f, "{}", day),
            Operand::Timestamp(ts) => write!(f, "\"{}\"", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// nft name of an IP protocol number, if it has one
pub fn protocol_name(number: u8) -> Option<&'static str> {
    PROTOCOL_NAMES
        .iter()
        .find(|(proto, _)| proto.0 == number)
        .map(|(_, name)| *name)
}

/// Seconds since UTC midnight of a UTC timestamp
pub(crate) fn utc_seconds_of(ts: &DateTime<FixedOffset>) -> u32 {
    ts.with_timezone(&Utc).num_seconds_from_midnight()
}

/// One member of a set; `key_end` is set for interval elements
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetElement {
    pub key: Operand,
    pub key_end: Option<Operand>,
}

/// A set the rule needs registered before its lookup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSpec {
    /// Name derived from the field, e.g. `sip_set`
    pub purpose: &'static str,
    pub kind: OperandKind,
    /// Elements are ranges
    pub interval: bool,
    pub elements: Vec<SetElement>,
}

/// How a field is compared
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Equals(Operand),
    /// Inclusive range
    Range { from: Operand, to: Operand },
    /// Membership in `CompiledRule::sets[index]`
    Member(usize),
}

/// One ordered comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchStep {
    pub field: Field,
    pub comparison: Comparison,
}

/// Log statement preceding the verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSpec {
    pub prefix: String,
    pub group: u16,
    pub snaplen: u32,
    pub queue_threshold: u16,
}

/// Terminal action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Divert to the userspace inspection queue
    Queue { num: u16 },
    Drop,
}

/// Everything needed to render one policy as one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub sets: Vec<SetSpec>,
    pub matches: Vec<MatchStep>,
    pub log: Option<LogSpec>,
    pub verdict: Verdict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_is_nul_padded_to_ifnamsiz() {
        let bytes = Operand::Interface("uplink0".into()).encode();
        assert_eq!(bytes.len(), IFNAME_LEN);
        assert_eq!(&bytes[..8], b"uplink0\0");
        assert!(bytes[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn port_mac_and_address_round_trip() {
        let values = [
            Operand::Port(20),
            Operand::Port(65535),
            Operand::Mac([0x32, 0xc8, 0x06, 0x2f, 0x51, 0x5f]),
            Operand::Ipv4(Ipv4Addr::new(192, 168, 1, 100)),
            Operand::Interface("enp4s0".into()),
            Operand::Protocol(6),
            Operand::Weekday(3),
        ];
        for value in values {
            let bytes = value.encode();
            assert_eq!(bytes.len(), value.kind().width());
            assert_eq!(Operand::decode(value.kind(), &bytes).unwrap(), value);
        }
    }

    #[test]
    fn port_is_big_endian() {
        assert_eq!(Operand::Port(0x10e1).encode(), vec![0x10, 0xe1]);
    }

    #[test]
    fn timestamp_round_trips_as_instant() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let ts = offset.with_ymd_and_hms(2022, 11, 22, 18, 0, 0).unwrap();
        let bytes = Operand::Timestamp(ts).encode();
        assert_eq!(Operand::decode(OperandKind::Timestamp, &bytes).unwrap(), Operand::Timestamp(ts));
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert!(Operand::decode(OperandKind::Port, &[1, 2, 3]).is_err());
    }

    #[test]
    fn text_forms() {
        assert_eq!(Operand::Interface("eth0".into()).to_string(), "\"eth0\"");
        assert_eq!(Operand::Mac([0x0c, 0x73, 0xeb, 0x92, 0x80, 0xcf]).to_string(), "0c:73:eb:92:80:cf");
        assert_eq!(Operand::Protocol(17).to_string(), "udp");
        assert_eq!(Operand::Protocol(99).to_string(), "99");
    }
}
