use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::models::ruleset::{ChainSpec, Family, TableSpec};
use crate::netfilter::expr::Expr;
use crate::netfilter::message::{Batch, ElementBytes, Message, SetDef};
use crate::netfilter::Netfilter;
use crate::utils::error::{FirewallError, FirewallResult};

/// Largest value a data register holds
const REGISTER_SIZE: usize = 16;

/// A set held by the simulated engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetState {
    pub def: SetDef,
    pub elements: Vec<ElementBytes>,
}

#[derive(Debug, Clone)]
struct ChainState {
    spec: ChainSpec,
    rules: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone)]
struct TableState {
    spec: TableSpec,
    chains: Vec<ChainState>,
    sets: Vec<SetState>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: Vec<TableState>,
    commits: usize,
    flushes: usize,
}

impl State {
    fn table(&self, spec: &TableSpec) -> Option<&TableState> {
        self.tables.iter().find(|t| t.spec == *spec)
    }

    fn table_mut(&mut self, spec: &TableSpec) -> FirewallResult<&mut TableState> {
        self.tables
            .iter_mut()
            .find(|t| t.spec == *spec)
            .ok_or_else(|| {
                FirewallError::engine(format!("table {} {} does not exist", spec.family, spec.name))
            })
    }

    fn apply(&mut self, message: &Message) -> FirewallResult<()> {
        match message {
            Message::FlushRuleset => {
                self.tables.clear();
                self.flushes += 1;
            }
            Message::AddTable(spec) => {
                if self.table(spec).is_none() {
                    self.tables.push(TableState {
                        spec: spec.clone(),
                        chains: Vec::new(),
                        sets: Vec::new(),
                    });
                }
            }
            Message::AddChain { table, chain } => {
                let table = self.table_mut(table)?;
                match table.chains.iter().find(|c| c.spec.name == chain.name) {
                    Some(existing) if existing.spec != *chain => {
                        return Err(FirewallError::engine(format!(
                            "chain {} exists with a different definition",
                            chain.name
                        )));
                    }
                    Some(_) => {}
                    None => table.chains.push(ChainState {
                        spec: chain.clone(),
                        rules: Vec::new(),
                    }),
                }
            }
            Message::AddSet {
                table,
                set,
                elements,
            } => {
                let table = self.table_mut(table)?;
                if table.sets.iter().any(|s| s.def.name == set.name) {
                    return Err(FirewallError::engine(format!("set {} already exists", set.name)));
                }
                validate_elements(set, elements)?;
                table.sets.push(SetState {
                    def: set.clone(),
                    elements: elements.clone(),
                });
            }
            Message::AddRule {
                table,
                chain,
                exprs,
            } => {
                let table = self.table_mut(table)?;
                for expr in exprs {
                    validate_expr(expr, &table.sets)?;
                }
                let chain = table
                    .chains
                    .iter_mut()
                    .find(|c| c.spec.name == *chain)
                    .ok_or_else(|| FirewallError::engine(format!("chain {} does not exist", chain)))?;
                chain.rules.push(exprs.clone());
            }
        }
        Ok(())
    }
}

fn validate_elements(set: &SetDef, elements: &[ElementBytes]) -> FirewallResult<()> {
    let key_len = set.key_len as usize;

    for (i, element) in elements.iter().enumerate() {
        let end_ok = element.key_end.as_ref().map_or(true, |end| end.len() == key_len);
        if element.key.len() != key_len || !end_ok {
            return Err(FirewallError::engine(format!(
                "element {} of set {} does not match key length {}",
                i, set.name, key_len
            )));
        }
        if element.key_end.is_some() && !set.interval {
            return Err(FirewallError::engine(format!(
                "set {} holds ranges but is not an interval set",
                set.name
            )));
        }
        if elements[..i].contains(element) {
            return Err(FirewallError::engine(format!(
                "duplicate element in set {}",
                set.name
            )));
        }
    }

    if set.interval {
        // Keys are big-endian, so byte order is value order
        let mut spans: Vec<(&[u8], &[u8])> = elements
            .iter()
            .map(|e| (e.key.as_slice(), e.key_end.as_deref().unwrap_or(&e.key)))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(FirewallError::engine(format!(
                    "set {} holds overlapping intervals",
                    set.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_expr(expr: &Expr, sets: &[SetState]) -> FirewallResult<()> {
    match expr {
        Expr::Cmp { data, .. } if data.is_empty() || data.len() > REGISTER_SIZE => {
            Err(FirewallError::engine(format!("cmp data of {} bytes", data.len())))
        }
        Expr::Range { from, to, .. } if from.len() != to.len() || from > to => Err(
            FirewallError::engine("range bounds differ in width or are reversed"),
        ),
        Expr::Lookup { set, .. } if !sets.iter().any(|s| s.def.name == *set) => {
            Err(FirewallError::engine(format!("lookup of unknown set {}", set)))
        }
        _ => Ok(()),
    }
}

/// Simulated filter engine.
///
/// Holds tables, chains, sets and rules in memory and applies batches atomically, so
/// the binary emitter can be exercised and inspected without privileges. Clones share
/// the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetfilter {
    state: Arc<Mutex<State>>,
}

impl MemoryNetfilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of a chain, in insertion order
    pub fn rules(&self, table: &TableSpec, chain: &str) -> Vec<Vec<Expr>> {
        let state = self.state.lock();
        state
            .table(table)
            .and_then(|t| t.chains.iter().find(|c| c.spec.name == chain))
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    /// A set with its elements
    pub fn set(&self, table: &TableSpec, name: &str) -> Option<SetState> {
        let state = self.state.lock();
        state
            .table(table)
            .and_then(|t| t.sets.iter().find(|s| s.def.name == name))
            .cloned()
    }

    pub fn chain(&self, table: &TableSpec, name: &str) -> Option<ChainSpec> {
        let state = self.state.lock();
        state
            .table(table)
            .and_then(|t| t.chains.iter().find(|c| c.spec.name == name))
            .map(|c| c.spec.clone())
    }

    /// Number of successfully applied batches
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Number of ruleset flushes applied
    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }
}

impl Netfilter for MemoryNetfilter {
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .iter()
            .filter(|t| t.spec.family == family)
            .map(|t| t.spec.name.clone())
            .collect())
    }

    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .table(table)
            .map(|t| t.chains.iter().map(|c| c.spec.name.clone()).collect())
            .unwrap_or_default())
    }

    fn list_sets(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .table(table)
            .map(|t| t.sets.iter().map(|s| s.def.name.clone()).collect())
            .unwrap_or_default())
    }

    fn commit(&mut self, batch: Batch) -> FirewallResult<()> {
        let mut state = self.state.lock();

        // Apply to a scratch copy so a rejected message leaves nothing behind
        let mut next = state.clone();
        for message in batch.messages() {
            trace!("Applying {:?}", message);
            next.apply(message)?;
        }
        next.commits += 1;
        *state = next;

        debug!("Committed batch of {} messages", batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ruleset::ChainPolicy;
    use crate::netfilter::expr::{CmpOp, REG_1};

    fn table() -> TableSpec {
        TableSpec::new(Family::Ip, "filter")
    }

    fn set(name: &str) -> SetDef {
        SetDef {
            name: name.into(),
            id: 1,
            key_type: 7,
            key_len: 4,
            interval: false,
        }
    }

    #[test]
    fn rejected_batch_changes_nothing() {
        let mut nf = MemoryNetfilter::new();
        nf.commit(Message::AddTable(table()).into()).unwrap();

        let mut batch = Batch::new();
        batch.push(Message::AddSet {
            table: table(),
            set: set("sip_set"),
            elements: vec![ElementBytes {
                key: vec![10, 0, 0, 1],
                key_end: None,
            }],
        });
        batch.push(Message::AddRule {
            table: table(),
            chain: "missing".into(),
            exprs: vec![],
        });

        assert!(matches!(nf.commit(batch), Err(FirewallError::EngineError(_))));
        assert!(nf.list_sets(&table()).unwrap().is_empty());
        assert_eq!(nf.commits(), 1);
    }

    #[test]
    fn table_and_chain_creation_is_idempotent() {
        let mut nf = MemoryNetfilter::new();
        let chain = ChainSpec::forward_filter("forward", ChainPolicy::Accept);
        for _ in 0..2 {
            let mut batch = Batch::new();
            batch.push(Message::AddTable(table()));
            batch.push(Message::AddChain {
                table: table(),
                chain: chain.clone(),
            });
            nf.commit(batch).unwrap();
        }
        assert_eq!(nf.list_tables(Family::Ip).unwrap(), vec!["filter"]);
        assert_eq!(nf.list_chains(&table()).unwrap(), vec!["forward"]);
        assert!(nf.list_tables(Family::Inet).unwrap().is_empty());
    }

    #[test]
    fn lookup_needs_registered_set_and_sets_are_unique() {
        let mut nf = MemoryNetfilter::new();
        let mut batch = Batch::new();
        batch.push(Message::AddTable(table()));
        batch.push(Message::AddChain {
            table: table(),
            chain: ChainSpec::forward_filter("forward", ChainPolicy::Drop),
        });
        nf.commit(batch).unwrap();

        let lookup = Message::AddRule {
            table: table(),
            chain: "forward".into(),
            exprs: vec![Expr::Lookup {
                sreg: REG_1,
                set: "sip_set".into(),
                set_id: 1,
            }],
        };
        assert!(nf.commit(lookup.clone().into()).is_err());

        let add_set = Message::AddSet {
            table: table(),
            set: set("sip_set"),
            elements: vec![],
        };
        nf.commit(add_set.clone().into()).unwrap();
        nf.commit(lookup.into()).unwrap();
        assert!(nf.commit(add_set.into()).is_err());
        assert_eq!(nf.rules(&table(), "forward").len(), 1);
    }

    #[test]
    fn element_width_is_checked() {
        let mut nf = MemoryNetfilter::new();
        nf.commit(Message::AddTable(table()).into()).unwrap();
        let bad = Message::AddSet {
            table: table(),
            set: set("sip_set"),
            elements: vec![ElementBytes {
                key: vec![10, 0, 1],
                key_end: None,
            }],
        };
        assert!(nf.commit(bad.into()).is_err());

        let oversized = Message::AddRule {
            table: table(),
            chain: "forward".into(),
            exprs: vec![Expr::Cmp {
                sreg: REG_1,
                op: CmpOp::Eq,
                data: vec![0; 17],
            }],
        };
        assert!(nf.commit(oversized.into()).is_err());
    }

    #[test]
    fn overlapping_intervals_are_rejected() {
        let mut nf = MemoryNetfilter::new();
        nf.commit(Message::AddTable(table()).into()).unwrap();
        let interval = SetDef {
            interval: true,
            ..set("sip_set")
        };
        let span = |from: [u8; 4], to: [u8; 4]| ElementBytes {
            key: from.to_vec(),
            key_end: Some(to.to_vec()),
        };

        let overlapping = Message::AddSet {
            table: table(),
            set: interval.clone(),
            elements: vec![span([10, 0, 0, 0], [10, 0, 0, 255]), span([10, 0, 0, 5], [10, 0, 0, 5])],
        };
        assert!(matches!(nf.commit(overlapping.into()), Err(FirewallError::EngineError(_))));

        let disjoint = Message::AddSet {
            table: table(),
            set: interval,
            elements: vec![span([10, 0, 1, 0], [10, 0, 1, 255]), span([10, 0, 0, 0], [10, 0, 0, 255])],
        };
        nf.commit(disjoint.into()).unwrap();
    }

    #[test]
    fn flush_removes_every_table() {
        let mut nf = MemoryNetfilter::new();
        nf.commit(Message::AddTable(table()).into()).unwrap();
        nf.commit(Message::FlushRuleset.into()).unwrap();
        assert!(nf.list_tables(Family::Ip).unwrap().is_empty());
        assert_eq!(nf.flushes(), 1);
    }
}
