use log::{info, trace};
use std::collections::HashSet;

use crate::compiler::step::{
    Comparison, CompiledRule, Field, MatchStep, Operand, OperandKind, SetSpec, Verdict,
};
use crate::emit::{check_family, RuleEmitter, RulesetControl};
use crate::models::ruleset::{ChainSpec, Family, TableSpec};
use crate::netfilter::expr::{
    CmpOp, Expr, MetaKey, PayloadBase, VerdictCode, ARPHRD_ETHER, ETH_P_IP, REG_1, REG_VERDICT,
};
use crate::netfilter::message::{Batch, ElementBytes, Message, SetDef};
use crate::netfilter::Netfilter;
use crate::utils::error::{FirewallError, FirewallResult};

/// Last second of a day
const LAST_SECOND: u32 = 86_399;

/// Emits rules as register operations committed through a [`Netfilter`] session
#[derive(Debug)]
pub struct BatchBackend<S: Netfilter> {
    session: S,
}

impl<S: Netfilter> BatchBackend<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Build the batch for one rule without committing it.
    ///
    /// Set names are derived from the field purpose and suffixed `_1`, `_2`, ... when a
    /// set of that name already exists in the table.
    pub fn plan(&mut self, table: &TableSpec, chain: &ChainSpec, rule: &CompiledRule) -> FirewallResult<Batch> {
        let mut taken: HashSet<String> = self.session.list_sets(table)?.into_iter().collect();
        let mut batch = Batch::new();
        let mut names = Vec::with_capacity(rule.sets.len());

        for (index, set) in rule.sets.iter().enumerate() {
            let def = SetDef {
                name: unique_name(set.purpose, &mut taken),
                id: index as u32 + 1,
                key_type: set.kind.nft_datatype(),
                key_len: set.kind.width() as u32,
                interval: set.interval,
            };
            names.push((def.name.clone(), def.id));
            batch.push(Message::AddSet {
                table: table.clone(),
                set: def,
                elements: set_elements(set),
            });
        }

        batch.push(Message::AddRule {
            table: table.clone(),
            chain: chain.name.clone(),
            exprs: lower_rule(rule, table.family, &names)?,
        });
        Ok(batch)
    }
}

impl<S: Netfilter> RulesetControl for BatchBackend<S> {
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>> {
        self.session.list_tables(family)
    }

    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        self.session.list_chains(table)
    }

    fn create_table(&mut self, table: &TableSpec) -> FirewallResult<()> {
        self.session.commit(Message::AddTable(table.clone()).into())
    }

    fn create_chain(&mut self, table: &TableSpec, chain: &ChainSpec) -> FirewallResult<()> {
        self.session.commit(
            Message::AddChain {
                table: table.clone(),
                chain: chain.clone(),
            }
            .into(),
        )
    }

    fn flush_ruleset(&mut self) -> FirewallResult<()> {
        self.session.commit(Message::FlushRuleset.into())
    }
}

impl<S: Netfilter> RuleEmitter for BatchBackend<S> {
    fn emit(&mut self, table: &TableSpec, chain: &ChainSpec, rule: &CompiledRule) -> FirewallResult<()> {
        let batch = self.plan(table, chain, rule)?;
        for message in batch.messages() {
            if let Message::AddRule { exprs, .. } = message {
                for expr in exprs {
                    trace!("{}", expr);
                }
            }
        }

        info!(
            "Committing rule with {} sets to {} {} {}",
            rule.sets.len(),
            table.family,
            table.name,
            chain.name
        );
        self.session.commit(batch)
    }
}

fn unique_name(purpose: &str, taken: &mut HashSet<String>) -> String {
    let mut name = purpose.to_string();
    let mut suffix = 0;
    while taken.contains(&name) {
        suffix += 1;
        name = format!("{}_{}", purpose, suffix);
    }
    taken.insert(name.clone());
    name
}

fn set_elements(set: &SetSpec) -> Vec<ElementBytes> {
    set.elements
        .iter()
        .map(|e| ElementBytes {
            key: e.key.encode(),
            key_end: e.key_end.as_ref().map(Operand::encode),
        })
        .collect()
}

/// Register operations for a compiled rule in a table of `family`; `sets` holds the
/// name and batch id of each of the rule's sets, in order
pub fn lower_rule(
    rule: &CompiledRule,
    family: Family,
    sets: &[(String, u32)],
) -> FirewallResult<Vec<Expr>> {
    check_family(family, rule)?;
    let mut exprs = Vec::new();
    let mut ipv4_known = false;

    for step in &rule.matches {
        if step.field.operand_kind() == OperandKind::Ipv4 && !ipv4_known {
            exprs.extend(ipv4_dependency(family));
            ipv4_known = true;
        }
        exprs.extend(load(step.field));
        exprs.push(compare(step, sets)?);
    }

    if let Some(log) = &rule.log {
        exprs.push(Expr::Log {
            prefix: log.prefix.clone(),
            group: log.group,
            snaplen: log.snaplen,
            queue_threshold: log.queue_threshold,
        });
    }

    exprs.push(match rule.verdict {
        Verdict::Queue { num } => Expr::Queue { num },
        Verdict::Drop => Expr::Immediate {
            dreg: REG_VERDICT,
            verdict: VerdictCode::Drop,
        },
    });
    Ok(exprs)
}

fn meta(key: MetaKey) -> Expr {
    Expr::Meta { key, dreg: REG_1 }
}

fn payload(base: PayloadBase, offset: u32, len: u32) -> Expr {
    Expr::Payload {
        base,
        offset,
        len,
        dreg: REG_1,
    }
}

fn hton(bytes: u32) -> Expr {
    Expr::Hton {
        sreg: REG_1,
        dreg: REG_1,
        len: bytes,
        size: bytes,
    }
}

fn cmp_eq(data: &[u8]) -> Expr {
    Expr::Cmp {
        sreg: REG_1,
        op: CmpOp::Eq,
        data: data.to_vec(),
    }
}

/// Check that the packet is IPv4 before its network header is read, as `nft` adds
/// for `ip saddr` outside `ip` tables
fn ipv4_dependency(family: Family) -> Vec<Expr> {
    match family {
        Family::Inet => vec![meta(MetaKey::NfProto), cmp_eq(&[Family::Ip.nfproto()])],
        Family::Bridge => vec![payload(PayloadBase::Link, 12, 2), cmp_eq(&ETH_P_IP)],
        Family::Netdev => vec![meta(MetaKey::Protocol), cmp_eq(&ETH_P_IP)],
        Family::Ip | Family::Ip6 | Family::Arp => Vec::new(),
    }
}

/// Operations leaving the field value in register 1, in the operand's encoding
fn load(field: Field) -> Vec<Expr> {
    let ethernet_only = [meta(MetaKey::IifType), cmp_eq(&ARPHRD_ETHER)];

    match field {
        Field::InputInterface => vec![meta(MetaKey::IifName)],
        Field::OutputInterface => vec![meta(MetaKey::OifName)],
        Field::SourceAddress => vec![payload(PayloadBase::Network, 12, 4)],
        Field::DestAddress => vec![payload(PayloadBase::Network, 16, 4)],
        Field::Protocol => vec![meta(MetaKey::L4Proto)],
        Field::SourceMac => {
            let mut ops = ethernet_only.to_vec();
            ops.push(payload(PayloadBase::Link, 6, 6));
            ops
        }
        Field::DestMac => {
            let mut ops = ethernet_only.to_vec();
            ops.push(payload(PayloadBase::Link, 0, 6));
            ops
        }
        Field::SourcePort => vec![payload(PayloadBase::Transport, 0, 2)],
        Field::DestPort => vec![payload(PayloadBase::Transport, 2, 2)],
        Field::HourOfDay => vec![meta(MetaKey::TimeHour), hton(4)],
        Field::Weekday => vec![meta(MetaKey::TimeDay)],
        Field::Timestamp => vec![meta(MetaKey::TimeNs), hton(8)],
    }
}

fn compare(step: &MatchStep, sets: &[(String, u32)]) -> FirewallResult<Expr> {
    Ok(match &step.comparison {
        Comparison::Equals(operand) => cmp_eq(&operand.encode()),
        Comparison::Range {
            from: Operand::Hour(start),
            to: Operand::Hour(end),
        } => hour_range(start.utc_seconds, end.utc_seconds),
        Comparison::Range { from, to } => Expr::Range {
            sreg: REG_1,
            op: CmpOp::Eq,
            from: from.encode(),
            to: to.encode(),
        },
        Comparison::Member(index) => {
            let (name, id) = sets.get(*index).ok_or_else(|| {
                FirewallError::engine(format!("{:?} refers to unregistered set {}", step.field, index))
            })?;
            Expr::Lookup {
                sreg: REG_1,
                set: name.clone(),
                set_id: *id,
            }
        }
    })
}

/// Daily window in UTC seconds. A window that wraps midnight once converted to UTC
/// matches everything outside its complement.
fn hour_range(start: u32, end: u32) -> Expr {
    let range = |op, from: u32, to: u32| Expr::Range {
        sreg: REG_1,
        op,
        from: from.to_be_bytes().to_vec(),
        to: to.to_be_bytes().to_vec(),
    };

    if start <= end {
        return range(CmpOp::Eq, start, end);
    }
    let (from, to) = (end + 1, start - 1);
    if from > to {
        range(CmpOp::Eq, 0, LAST_SECOND)
    } else {
        range(CmpOp::Neq, from, to)
    }
}
