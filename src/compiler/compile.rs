use log::debug;
use pnet::util::MacAddr;

use crate::compiler::range;
use crate::compiler::step::{
    Comparison, CompiledRule, Field, LogSpec, MatchStep, Operand, SetElement, SetSpec, Verdict,
    IFNAME_LEN, PROTOCOL_NAMES,
};
use crate::compiler::time::{self, TimeAnchor, TimeMatch};
use crate::models::policy::{Action, Policy};
use crate::utils::error::{FirewallError, FirewallResult};

/// Appended to the log tag of Warn policies
pub const WARN_MARKER: &str = "#W";
/// Appended to the log tag when detailed logging is requested
pub const DETAIL_MARKER: &str = "@L";

/// Netlink log group matched packets are sent to
pub const LOG_GROUP: u16 = 1;
/// Bytes of each packet copied to the log group
pub const LOG_SNAPLEN: u32 = 132;
/// Packets queued in the kernel before a log batch is sent
pub const LOG_QUEUE_THRESHOLD: u16 = 20;
/// Longest log prefix the engine accepts
pub const MAX_LOG_PREFIX: usize = 127;

/// Userspace queue inspected traffic is diverted to
pub const INSPECTION_QUEUE: u16 = 0;

/// Match-step compiler.
///
/// Turns a [`Policy`] into a [`CompiledRule`] whose steps follow the fixed field order
/// interfaces, addresses, protocol, MAC, ports, time, then log and verdict.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    /// Pinned anchor for time expansion; the current local date when unset
    anchor: Option<TimeAnchor>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand time windows against a fixed date and zone
    pub fn with_anchor(anchor: TimeAnchor) -> Self {
        Self {
            anchor: Some(anchor),
        }
    }

    /// Compile one policy. Fails without side effects on any malformed field.
    pub fn compile(&self, policy: &Policy) -> FirewallResult<CompiledRule> {
        let mut rule = RuleBuilder::default();

        rule.push(Field::InputInterface, interfaces(&policy.source_interfaces)?);
        rule.push(Field::OutputInterface, interfaces(&policy.dest_interfaces)?);
        rule.push(Field::SourceAddress, addresses(&policy.source_ips)?);
        rule.push(Field::DestAddress, addresses(&policy.dest_ips)?);

        if !policy.protocol.trim().is_empty() {
            let proto = parse_protocol(&policy.protocol)?;
            rule.push(Field::Protocol, vec![single(Operand::Protocol(proto))]);
        }

        if !policy.source_mac.trim().is_empty() {
            let mac = parse_mac(&policy.source_mac)?;
            rule.push(Field::SourceMac, vec![single(Operand::Mac(mac))]);
        }
        if !policy.dest_mac.trim().is_empty() {
            let mac = parse_mac(&policy.dest_mac)?;
            rule.push(Field::DestMac, vec![single(Operand::Mac(mac))]);
        }

        if policy.source_port != 0 {
            rule.push(Field::SourcePort, vec![single(Operand::Port(policy.source_port))]);
        }
        if policy.dest_port != 0 {
            rule.push(Field::DestPort, vec![single(Operand::Port(policy.dest_port))]);
        }

        if !policy.times.is_empty() {
            let anchor = self.anchor.unwrap_or_else(TimeAnchor::now);
            for time_match in time::expand(&policy.times, &anchor)? {
                rule.push_time(time_match);
            }
        }

        let log = log_spec(policy)?;
        let verdict = match policy.action {
            Action::Allow | Action::Warn => Verdict::Queue {
                num: INSPECTION_QUEUE,
            },
            Action::Drop => Verdict::Drop,
        };

        debug!(
            "Compiled policy {}: {} match steps, {} sets, verdict {:?}",
            policy.label(),
            rule.matches.len(),
            rule.sets.len(),
            verdict
        );

        Ok(CompiledRule {
            sets: rule.sets,
            matches: rule.matches,
            log,
            verdict,
        })
    }
}

#[derive(Default)]
struct RuleBuilder {
    sets: Vec<SetSpec>,
    matches: Vec<MatchStep>,
}

impl RuleBuilder {
    /// No values: nothing. One value: equals or range. More: a set and a lookup.
    fn push(&mut self, field: Field, values: Vec<SetElement>) {
        let mut unique: Vec<SetElement> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }

        let interval = unique.iter().any(|e| e.key_end.is_some());
        if interval && unique.len() > 1 {
            unique = merge_overlapping(unique);
        }

        let comparison = match unique.len() {
            0 => return,
            1 => {
                let SetElement { key, key_end } = unique.remove(0);
                match key_end {
                    Some(to) if to != key => Comparison::Range { from: key, to },
                    _ => Comparison::Equals(key),
                }
            }
            _ => {
                self.sets.push(SetSpec {
                    purpose: field.set_purpose(),
                    kind: field.operand_kind(),
                    interval,
                    elements: unique,
                });
                Comparison::Member(self.sets.len() - 1)
            }
        };

        self.matches.push(MatchStep { field, comparison });
    }

    fn push_time(&mut self, time_match: TimeMatch) {
        match time_match {
            TimeMatch::Hour { start, end } => self.push(
                Field::HourOfDay,
                vec![span(Operand::Hour(start), Operand::Hour(end))],
            ),
            TimeMatch::Weekdays(days) => self.push(
                Field::Weekday,
                days.into_iter().map(|d| single(Operand::Weekday(d))).collect(),
            ),
            TimeMatch::Absolute(iv) => self.push(
                Field::Timestamp,
                vec![span(Operand::Timestamp(iv.start), Operand::Timestamp(iv.end))],
            ),
            TimeMatch::Intervals(intervals) => self.push(
                Field::Timestamp,
                intervals
                    .into_iter()
                    .map(|iv| span(Operand::Timestamp(iv.start), Operand::Timestamp(iv.end)))
                    .collect(),
            ),
        }
    }
}

/// Sort interval members and fold overlapping ones together; interval sets reject
/// overlaps. Singles become one-value intervals.
fn merge_overlapping(mut elements: Vec<SetElement>) -> Vec<SetElement> {
    for element in &mut elements {
        if element.key_end.is_none() {
            element.key_end = Some(element.key.clone());
        }
    }
    elements.sort();

    let mut merged: Vec<SetElement> = Vec::with_capacity(elements.len());
    for element in elements {
        match merged.last_mut() {
            Some(last) if last.key_end.as_ref().map_or(false, |end| element.key <= *end) => {
                if element.key_end > last.key_end {
                    last.key_end = element.key_end;
                }
            }
            _ => merged.push(element),
        }
    }
    merged
}

fn single(key: Operand) -> SetElement {
    SetElement { key, key_end: None }
}

fn span(from: Operand, to: Operand) -> SetElement {
    SetElement {
        key: from,
        key_end: Some(to),
    }
}

fn interfaces(names: &[String]) -> FirewallResult<Vec<SetElement>> {
    names
        .iter()
        .map(|name| validate_interface(name).map(|n| single(Operand::Interface(n))))
        .collect()
}

fn validate_interface(name: &str) -> FirewallResult<String> {
    let name = name.trim();
    if name.is_empty() || name.len() >= IFNAME_LEN {
        return Err(FirewallError::parse(format!(
            "interface name '{}' must be 1 to {} bytes",
            name,
            IFNAME_LEN - 1
        )));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '\'')
    {
        return Err(FirewallError::parse(format!(
            "interface name '{}' contains invalid characters",
            name
        )));
    }
    Ok(name.to_string())
}

fn addresses(inputs: &[String]) -> FirewallResult<Vec<SetElement>> {
    inputs
        .iter()
        .map(|input| {
            let resolved = range::resolve(input)?;
            Ok(SetElement {
                key: Operand::Ipv4(resolved.start),
                key_end: resolved.end.map(Operand::Ipv4),
            })
        })
        .collect()
}

/// Protocol name or IANA number
pub fn parse_protocol(name: &str) -> FirewallResult<u8> {
    let wanted = name.trim().to_lowercase();
    let wanted = match wanted.as_str() {
        "icmpv6" => "ipv6-icmp",
        other => other,
    };

    if let Some((proto, _)) = PROTOCOL_NAMES.iter().find(|(_, n)| *n == wanted) {
        return Ok(proto.0);
    }
    wanted
        .parse::<u8>()
        .map_err(|_| FirewallError::parse(format!("unknown protocol '{}'", name.trim())))
}

/// `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(text: &str) -> FirewallResult<[u8; 6]> {
    let MacAddr(a, b, c, d, e, f) = text
        .trim()
        .parse::<MacAddr>()
        .map_err(|_| FirewallError::parse(format!("invalid MAC address '{}'", text.trim())))?;
    Ok([a, b, c, d, e, f])
}

fn log_spec(policy: &Policy) -> FirewallResult<Option<LogSpec>> {
    if policy.log_tag.is_empty() {
        return Ok(None);
    }

    let mut prefix = policy.log_tag.clone();
    if policy.action == Action::Warn {
        prefix.push_str(WARN_MARKER);
    }
    if policy.log_detail {
        prefix.push_str(DETAIL_MARKER);
    }

    if prefix.chars().count() > MAX_LOG_PREFIX {
        return Err(FirewallError::parse(format!(
            "log prefix '{}' is longer than {} characters",
            prefix, MAX_LOG_PREFIX
        )));
    }
    if prefix.chars().any(|c| c == '"' || c.is_control()) {
        return Err(FirewallError::parse(format!(
            "log prefix '{}' contains invalid characters",
            prefix
        )));
    }

    Ok(Some(LogSpec {
        prefix,
        group: LOG_GROUP,
        snaplen: LOG_SNAPLEN,
        queue_threshold: LOG_QUEUE_THRESHOLD,
    }))
}
