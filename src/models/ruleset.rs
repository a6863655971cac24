use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::{FirewallError, FirewallResult};

/// Looks `s` up in a name table, case-insensitively
fn parse_named<T: Copy>(s: &str, names: &[(&str, T)], what: &str) -> FirewallResult<T> {
    let wanted = s.trim().to_lowercase();
    names
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| FirewallError::parse(format!("unknown {} '{}'", what, s)))
}

/// Address family namespace of tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Ip,
    Ip6,
    Inet,
    Arp,
    Bridge,
    Netdev,
}

impl Family {
    const NAMES: [(&'static str, Family); 6] = [
        ("ip", Family::Ip),
        ("ip6", Family::Ip6),
        ("inet", Family::Inet),
        ("arp", Family::Arp),
        ("bridge", Family::Bridge),
        ("netdev", Family::Netdev),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
            Family::Inet => "inet",
            Family::Arp => "arp",
            Family::Bridge => "bridge",
            Family::Netdev => "netdev",
        }
    }

    /// NFPROTO_* value used on the wire
    pub fn nfproto(self) -> u8 {
        match self {
            Family::Inet => 1,
            Family::Ip => 2,
            Family::Arp => 3,
            Family::Netdev => 5,
            Family::Bridge => 7,
            Family::Ip6 => 10,
        }
    }
}

impl FromStr for Family {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        parse_named(s, &Self::NAMES, "address family")
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base chain type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Filter,
    Nat,
    Route,
}

impl ChainType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainType::Filter => "filter",
            ChainType::Nat => "nat",
            ChainType::Route => "route",
        }
    }
}

impl FromStr for ChainType {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        parse_named(
            s,
            &[
                ("filter", ChainType::Filter),
                ("nat", ChainType::Nat),
                ("route", ChainType::Route),
            ],
            "chain type",
        )
    }
}

/// Netfilter hook a base chain attaches to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    Prerouting,
    Input,
    #[default]
    Forward,
    Output,
    Postrouting,
    Ingress,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Prerouting => "prerouting",
            Hook::Input => "input",
            Hook::Forward => "forward",
            Hook::Output => "output",
            Hook::Postrouting => "postrouting",
            Hook::Ingress => "ingress",
        }
    }
}

impl FromStr for Hook {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        parse_named(
            s,
            &[
                ("prerouting", Hook::Prerouting),
                ("input", Hook::Input),
                ("forward", Hook::Forward),
                ("output", Hook::Output),
                ("postrouting", Hook::Postrouting),
                ("ingress", Hook::Ingress),
            ],
            "hook",
        )
    }
}

/// Verdict applied when no rule of a base chain matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    #[default]
    Accept,
    Drop,
}

impl ChainPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainPolicy::Accept => "accept",
            ChainPolicy::Drop => "drop",
        }
    }
}

impl FromStr for ChainPolicy {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        parse_named(
            s,
            &[("accept", ChainPolicy::Accept), ("drop", ChainPolicy::Drop)],
            "chain policy",
        )
    }
}

/// Table addressed by (family, name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub family: Family,
    pub name: String,
}

impl TableSpec {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

/// Base chain definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub chain_type: ChainType,
    pub hook: Hook,
    pub priority: i32,
    pub policy: ChainPolicy,
}

impl ChainSpec {
    /// A filter chain on the forward hook at filter priority
    pub fn forward_filter(name: impl Into<String>, policy: ChainPolicy) -> Self {
        Self {
            name: name.into(),
            chain_type: ChainType::Filter,
            hook: Hook::Forward,
            priority: 0,
            policy,
        }
    }
}
