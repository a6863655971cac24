//! Live engine session on top of `rustables`.
//!
//! Every batch is translated in full before anything reaches the kernel, so a
//! construct the library cannot express fails the commit without side effects.

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};
use rustables::expr::{
    Cmp, CmpOp as NlCmpOp, Immediate, Log, Lookup, Meta, MetaType, Payload, Register,
    VerdictKind,
};
use rustables::query::list_objects_with_data;
use rustables::set::{SetBuilder, SetElementList, SetKey};
use rustables::{
    list_chains_for_table, list_tables, Batch as NlBatch, Chain, ChainPolicy as NlChainPolicy,
    ChainType as NlChainType, Hook as NlHook, HookClass, MsgType, ProtocolFamily, Rule, Set,
    Table,
};

use crate::models::ruleset::{ChainPolicy, ChainSpec, ChainType, Family, Hook, TableSpec};
use crate::netfilter::expr::{CmpOp, Expr, MetaKey, VerdictCode};
use crate::netfilter::message::{Batch, ElementBytes, Message, SetDef};
use crate::netfilter::Netfilter;
use crate::utils::error::{FirewallError, FirewallResult};

/// Session with the kernel's nf_tables subsystem.
///
/// Requires `CAP_NET_ADMIN`. Each query and commit uses its own netlink socket.
#[derive(Debug, Default)]
pub struct NetlinkSession {
    committed: usize,
}

impl NetlinkSession {
    pub fn open() -> FirewallResult<Self> {
        // Fails early when the process may not talk to nf_tables
        list_tables().map_err(engine_error)?;
        debug!("Opened nf_tables session");
        Ok(Self::default())
    }
}

impl Netfilter for NetlinkSession {
    // Tables of every family share one dump; the library does not expose the family of a
    // listed table, so names are matched across families.
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>> {
        let names: Vec<String> = list_tables()
            .map_err(engine_error)?
            .iter()
            .filter_map(|table| table.get_name().cloned())
            .collect();
        trace!("Kernel reports tables {:?} (asked for {})", names, family);
        Ok(names)
    }

    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        Ok(list_chains_for_table(&nl_table(table))
            .map_err(engine_error)?
            .iter()
            .filter_map(|chain| chain.get_name().cloned())
            .collect())
    }

    fn list_sets(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        let mut names = Vec::new();
        list_objects_with_data(
            rustables::sys::NFT_MSG_GETSET as u16,
            &|set: Set, names: &mut Vec<String>| {
                if set.get_table() == Some(&table.name) {
                    if let Some(name) = set.get_name() {
                        names.push(name.clone());
                    }
                }
                Ok(())
            },
            None,
            &mut names,
        )
        .map_err(engine_error)?;
        Ok(names)
    }

    fn commit(&mut self, batch: Batch) -> FirewallResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let flushed = if batch.messages().contains(&Message::FlushRuleset) {
            list_tables().map_err(engine_error)?
        } else {
            Vec::new()
        };
        let staged = stage(&batch, &flushed)?;
        staged.send().map_err(engine_error)?;

        self.committed += 1;
        debug!(
            "Committed batch #{} of {} messages",
            self.committed,
            batch.len()
        );
        Ok(())
    }
}

fn engine_error(err: impl fmt::Display) -> FirewallError {
    FirewallError::engine(err.to_string())
}

fn unsupported(what: impl fmt::Display) -> FirewallError {
    FirewallError::UnsupportedFormat(format!("netlink backend cannot express {}", what))
}

/// Translate a batch into library objects. `flushed` holds the live tables a
/// `FlushRuleset` deletes.
fn stage(batch: &Batch, flushed: &[Table]) -> FirewallResult<NlBatch> {
    let mut staged = NlBatch::new();
    let mut sets: HashMap<String, Set> = HashMap::new();

    for message in batch.messages() {
        match message {
            Message::FlushRuleset => {
                for table in flushed {
                    staged.add(table, MsgType::Del);
                }
            }
            Message::AddTable(table) => staged.add(&nl_table(table), MsgType::Add),
            Message::AddChain { table, chain } => {
                staged.add(&base_chain(&nl_table(table), chain)?, MsgType::Add)
            }
            Message::AddSet {
                table,
                set,
                elements,
            } => {
                let (nl_set, nl_elements) = build_set(&nl_table(table), set, elements)?;
                staged.add(&nl_set, MsgType::Add);
                staged.add(&nl_elements, MsgType::Add);
                sets.insert(set.name.clone(), nl_set);
            }
            Message::AddRule {
                table,
                chain,
                exprs,
            } => {
                let chain = Chain::new(&nl_table(table)).with_name(chain.as_str());
                let mut rule = Rule::new(&chain).map_err(engine_error)?;
                for expr in exprs {
                    rule = lower_expr(rule, expr, &sets)?;
                }
                staged.add(&rule, MsgType::Add);
            }
        }
    }

    trace!("Staged {} messages", batch.len());
    Ok(staged)
}

fn nl_table(table: &TableSpec) -> Table {
    let family = match table.family {
        Family::Ip => ProtocolFamily::Ipv4,
        Family::Ip6 => ProtocolFamily::Ipv6,
        Family::Inet => ProtocolFamily::Inet,
        Family::Arp => ProtocolFamily::Arp,
        Family::Bridge => ProtocolFamily::Bridge,
        Family::Netdev => ProtocolFamily::NetDev,
    };
    Table::new(family).with_name(table.name.as_str())
}

fn base_chain(table: &Table, spec: &ChainSpec) -> FirewallResult<Chain> {
    let class = match spec.hook {
        Hook::Prerouting => HookClass::PreRouting,
        Hook::Input => HookClass::In,
        Hook::Forward => HookClass::Forward,
        Hook::Output => HookClass::Out,
        Hook::Postrouting => HookClass::PostRouting,
        Hook::Ingress => return Err(unsupported("the ingress hook")),
    };
    let policy = match spec.policy {
        ChainPolicy::Accept => NlChainPolicy::Accept,
        ChainPolicy::Drop => NlChainPolicy::Drop,
    };
    let chain_type = match spec.chain_type {
        ChainType::Filter => NlChainType::Filter,
        ChainType::Nat => NlChainType::Nat,
        ChainType::Route => NlChainType::Route,
    };
    Ok(Chain::new(table)
        .with_name(spec.name.as_str())
        .with_hook(NlHook::new(class, spec.priority))
        .with_policy(policy)
        .with_type(chain_type))
}

/// Set key of a fixed width; the datatype is stamped on the finished set
struct Key<const N: usize>([u8; N]);

impl<const N: usize> SetKey for Key<N> {
    const TYPE: u32 = 0;
    const LEN: u32 = N as u32;

    fn data(&self) -> Box<[u8]> {
        Box::new(self.0)
    }
}

fn build_set(
    table: &Table,
    def: &SetDef,
    elements: &[ElementBytes],
) -> FirewallResult<(Set, SetElementList)> {
    if def.interval {
        return Err(unsupported(format!("interval set {}", def.name)));
    }
    match def.key_len {
        1 => fill_set::<1>(table, def, elements),
        2 => fill_set::<2>(table, def, elements),
        4 => fill_set::<4>(table, def, elements),
        6 => fill_set::<6>(table, def, elements),
        8 => fill_set::<8>(table, def, elements),
        16 => fill_set::<16>(table, def, elements),
        len => Err(unsupported(format!("{}-byte keys of set {}", len, def.name))),
    }
}

fn fill_set<const N: usize>(
    table: &Table,
    def: &SetDef,
    elements: &[ElementBytes],
) -> FirewallResult<(Set, SetElementList)> {
    let mut builder = SetBuilder::<Key<N>>::new(def.name.as_str(), table).map_err(engine_error)?;
    for element in elements {
        let key = <[u8; N]>::try_from(element.key.as_slice()).map_err(|_| {
            FirewallError::engine(format!("set {} holds a key that is not {} bytes", def.name, N))
        })?;
        builder.add(&Key(key));
    }
    let (set, elements) = builder.finish();
    Ok((set.with_key_type(def.key_type), elements))
}

fn meta_type(key: MetaKey) -> FirewallResult<MetaType> {
    Ok(match key {
        MetaKey::Protocol => MetaType::Protocol,
        MetaKey::NfProto => MetaType::NfProto,
        MetaKey::IifName => MetaType::IifName,
        MetaKey::OifName => MetaType::OifName,
        MetaKey::IifType => MetaType::IifType,
        MetaKey::L4Proto => MetaType::L4Proto,
        MetaKey::TimeNs | MetaKey::TimeDay | MetaKey::TimeHour => {
            return Err(unsupported(format!("meta {:?} matches", key)))
        }
    })
}

fn cmp_op(op: CmpOp) -> NlCmpOp {
    match op {
        CmpOp::Eq => NlCmpOp::Eq,
        CmpOp::Neq => NlCmpOp::Neq,
    }
}

fn lower_expr(rule: Rule, expr: &Expr, sets: &HashMap<String, Set>) -> FirewallResult<Rule> {
    Ok(match expr {
        Expr::Meta { key, .. } => rule.with_expr(Meta::new(meta_type(*key)?)),
        Expr::Payload {
            base, offset, len, ..
        } => rule.with_expr(
            Payload::default()
                .with_dreg(Register::Reg1)
                .with_base(base.code())
                .with_offset(*offset)
                .with_len(*len),
        ),
        Expr::Cmp { op, data, .. } => rule.with_expr(Cmp::new(cmp_op(*op), data.clone())),
        // cmp orders big-endian operands bytewise, so two bounds cover an inclusive range
        Expr::Range {
            op: CmpOp::Eq,
            from,
            to,
            ..
        } => rule
            .with_expr(Cmp::new(NlCmpOp::Gte, from.clone()))
            .with_expr(Cmp::new(NlCmpOp::Lte, to.clone())),
        Expr::Lookup { set, .. } => {
            let set = sets
                .get(set)
                .ok_or_else(|| FirewallError::engine(format!("lookup of unknown set {}", set)))?;
            rule.with_expr(Lookup::new(set).map_err(engine_error)?)
        }
        Expr::Log {
            prefix,
            group,
            snaplen,
            queue_threshold,
        } => rule.with_expr(
            Log::new(Some(*group), Some(prefix.as_str()))
                .map_err(engine_error)?
                .with_snaplen(*snaplen)
                .with_qthreshold(*queue_threshold),
        ),
        Expr::Queue { num: 0 } => rule.with_expr(Immediate::new_verdict(VerdictKind::Queue)),
        Expr::Immediate {
            verdict: VerdictCode::Drop,
            ..
        } => rule.with_expr(Immediate::new_verdict(VerdictKind::Drop)),
        Expr::Range { .. } | Expr::Hton { .. } | Expr::Queue { .. } => {
            return Err(unsupported(expr))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::expr::{PayloadBase, REG_1, REG_VERDICT};

    fn table() -> TableSpec {
        TableSpec::new(Family::Ip, "filter")
    }

    fn rule(exprs: Vec<Expr>) -> Batch {
        Message::AddRule {
            table: table(),
            chain: "forward".to_string(),
            exprs,
        }
        .into()
    }

    fn set(interval: bool) -> Message {
        Message::AddSet {
            table: table(),
            set: SetDef {
                name: "sip_set".to_string(),
                id: 1,
                key_type: 7,
                key_len: 4,
                interval,
            },
            elements: vec![
                ElementBytes {
                    key: vec![10, 0, 0, 1],
                    key_end: None,
                },
                ElementBytes {
                    key: vec![10, 0, 0, 9],
                    key_end: None,
                },
            ],
        }
    }

    fn is_unsupported(result: FirewallResult<NlBatch>) -> bool {
        matches!(result, Err(FirewallError::UnsupportedFormat(_)))
    }

    #[test]
    fn stages_table_chain_set_and_rule() {
        let mut batch = Batch::new();
        batch.push(Message::FlushRuleset);
        batch.push(Message::AddTable(table()));
        batch.push(Message::AddChain {
            table: table(),
            chain: ChainSpec::forward_filter("forward", ChainPolicy::Accept),
        });
        batch.push(set(false));
        batch.push(Message::AddRule {
            table: table(),
            chain: "forward".to_string(),
            exprs: vec![
                Expr::Payload {
                    base: PayloadBase::Network,
                    offset: 12,
                    len: 4,
                    dreg: REG_1,
                },
                Expr::Lookup {
                    sreg: REG_1,
                    set: "sip_set".to_string(),
                    set_id: 1,
                },
                Expr::Range {
                    sreg: REG_1,
                    op: CmpOp::Eq,
                    from: vec![10, 0, 0, 0],
                    to: vec![10, 0, 0, 255],
                },
                Expr::Queue { num: 0 },
            ],
        });

        assert!(stage(&batch, &[]).is_ok());
    }

    #[test]
    fn lookups_need_a_set_from_the_same_batch() {
        let batch = rule(vec![Expr::Lookup {
            sreg: REG_1,
            set: "dip_set".to_string(),
            set_id: 2,
        }]);
        assert!(matches!(
            stage(&batch, &[]),
            Err(FirewallError::EngineError(_))
        ));
    }

    #[test]
    fn time_matches_and_byteorder_are_refused_before_sending() {
        let time = rule(vec![Expr::Meta {
            key: MetaKey::TimeHour,
            dreg: REG_1,
        }]);
        assert!(is_unsupported(stage(&time, &[])));

        let hton = rule(vec![Expr::Hton {
            sreg: REG_1,
            dreg: REG_1,
            len: 8,
            size: 8,
        }]);
        assert!(is_unsupported(stage(&hton, &[])));
    }

    #[test]
    fn negated_ranges_and_numbered_queues_are_refused() {
        let negated = rule(vec![Expr::Range {
            sreg: REG_1,
            op: CmpOp::Neq,
            from: vec![0, 0, 0, 1],
            to: vec![0, 0, 0, 2],
        }]);
        assert!(is_unsupported(stage(&negated, &[])));

        let queue = rule(vec![Expr::Queue { num: 3 }]);
        assert!(is_unsupported(stage(&queue, &[])));

        let drop = rule(vec![Expr::Immediate {
            dreg: REG_VERDICT,
            verdict: VerdictCode::Drop,
        }]);
        assert!(stage(&drop, &[]).is_ok());
    }

    #[test]
    fn interval_sets_and_ingress_chains_are_refused() {
        let interval: Batch = set(true).into();
        assert!(is_unsupported(stage(&interval, &[])));

        let mut ingress = ChainSpec::forward_filter("ingress", ChainPolicy::Accept);
        ingress.hook = Hook::Ingress;
        let batch: Batch = Message::AddChain {
            table: TableSpec::new(Family::Netdev, "filter"),
            chain: ingress,
        }
        .into();
        assert!(is_unsupported(stage(&batch, &[])));
    }
}
