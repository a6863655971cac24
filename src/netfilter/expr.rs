//! Register operations a rule is made of.
//!
//! Rendering follows `nft --debug=netlink` so trace logs read like the kernel's view.

use std::fmt;

/// Register holding the verdict
pub const REG_VERDICT: u32 = 0;
/// First 16-byte data register
pub const REG_1: u32 = 1;

/// ARPHRD_ETHER in host order, as `meta iiftype` loads it
pub const ARPHRD_ETHER: [u8; 2] = 1u16.to_ne_bytes();

/// ETH_P_IP in network order, as the EtherType and `meta protocol` carry it
pub const ETH_P_IP: [u8; 2] = 0x0800u16.to_be_bytes();

/// Packet metadata a `meta` expression loads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    Protocol,
    NfProto,
    IifName,
    OifName,
    IifType,
    L4Proto,
    TimeNs,
    TimeDay,
    TimeHour,
}

impl MetaKey {
    fn name(self) -> &'static str {
        match self {
            MetaKey::Protocol => "protocol",
            MetaKey::NfProto => "nfproto",
            MetaKey::IifName => "iifname",
            MetaKey::OifName => "oifname",
            MetaKey::IifType => "iiftype",
            MetaKey::L4Proto => "l4proto",
            MetaKey::TimeNs => "time",
            MetaKey::TimeDay => "day",
            MetaKey::TimeHour => "hour",
        }
    }
}

/// Header a payload offset is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBase {
    Link,
    Network,
    Transport,
}

impl PayloadBase {
    /// NFT_PAYLOAD_*_HEADER value
    pub fn code(self) -> u32 {
        match self {
            PayloadBase::Link => 0,
            PayloadBase::Network => 1,
            PayloadBase::Transport => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PayloadBase::Link => "link",
            PayloadBase::Network => "network",
            PayloadBase::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
}

impl CmpOp {
    fn name(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Neq => "neq",
        }
    }
}

/// Immediate verdicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictCode {
    Drop,
}

/// One register operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Meta {
        key: MetaKey,
        dreg: u32,
    },
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: u32,
    },
    Cmp {
        sreg: u32,
        op: CmpOp,
        data: Vec<u8>,
    },
    Range {
        sreg: u32,
        op: CmpOp,
        from: Vec<u8>,
        to: Vec<u8>,
    },
    Lookup {
        sreg: u32,
        set: String,
        set_id: u32,
    },
    /// Host to network order conversion of `len` bytes in `size`-byte words
    Hton {
        sreg: u32,
        dreg: u32,
        len: u32,
        size: u32,
    },
    Log {
        prefix: String,
        group: u16,
        snaplen: u32,
        queue_threshold: u16,
    },
    Queue {
        num: u16,
    },
    Immediate {
        dreg: u32,
        verdict: VerdictCode,
    },
}

impl Expr {
    /// Expression type name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Expr::Meta { .. } => "meta",
            Expr::Payload { .. } => "payload",
            Expr::Cmp { .. } => "cmp",
            Expr::Range { .. } => "range",
            Expr::Lookup { .. } => "lookup",
            Expr::Hton { .. } => "byteorder",
            Expr::Log { .. } => "log",
            Expr::Queue { .. } => "queue",
            Expr::Immediate { .. } => "immediate",
        }
    }

    /// Operand bytes compared by a `cmp` or `range`
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Expr::Cmp { data, .. } => Some(data),
            Expr::Range { from, .. } => Some(from),
            _ => None,
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.chunks(4)
        .map(|word| {
            let digits: String = word.iter().map(|b| format!("{:02x}", b)).collect();
            format!("0x{}", digits)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Meta { key, dreg } => write!(f, "[ meta load {} => reg {} ]", key.name(), dreg),
            Expr::Payload {
                base,
                offset,
                len,
                dreg,
            } => write!(
                f,
                "[ payload load {}b @ {} header + {} => reg {} ]",
                len,
                base.name(),
                offset,
                dreg
            ),
            Expr::Cmp { sreg, op, data } => {
                write!(f, "[ cmp {} reg {} {} ]", op.name(), sreg, hex(data))
            }
            Expr::Range { sreg, op, from, to } => write!(
                f,
                "[ range {} reg {} {} {} ]",
                op.name(),
                sreg,
                hex(from),
                hex(to)
            ),
            Expr::Lookup { sreg, set, set_id } => {
                write!(f, "[ lookup reg {} set {} id {} ]", sreg, set, set_id)
            }
            Expr::Hton {
                sreg,
                dreg,
                len,
                size,
            } => write!(
                f,
                "[ byteorder reg {} = hton(reg {}, {}, {}) ]",
                dreg, sreg, size, len
            ),
            Expr::Log {
                prefix,
                group,
                snaplen,
                queue_threshold,
            } => write!(
                f,
                "[ log prefix {} group {} snaplen {} qthreshold {} ]",
                prefix, group, snaplen, queue_threshold
            ),
            Expr::Queue { num } => write!(f, "[ queue num {} ]", num),
            Expr::Immediate { dreg, verdict } => {
                let name = match verdict {
                    VerdictCode::Drop => "drop",
                };
                write!(f, "[ immediate reg {} {} ]", dreg, name)
            }
        }
    }
}
