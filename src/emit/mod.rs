//! Rule emitters.
//!
//! Both backends consume the same [`CompiledRule`]: the text backend renders it as an
//! `nft add rule` command, the batch backend lowers it to register operations and
//! commits them through a [`Netfilter`](crate::netfilter::Netfilter) session.

pub mod batch;
pub mod text;

use crate::compiler::step::{CompiledRule, OperandKind};
use crate::models::ruleset::{ChainSpec, Family, TableSpec};
use crate::utils::error::{FirewallError, FirewallResult};

pub use batch::BatchBackend;
pub use text::TextBackend;

/// Table/chain bookkeeping a backend provides to the lifecycle manager
pub trait RulesetControl {
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>>;

    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>>;

    fn create_table(&mut self, table: &TableSpec) -> FirewallResult<()>;

    fn create_chain(&mut self, table: &TableSpec, chain: &ChainSpec) -> FirewallResult<()>;

    /// Remove every table of every family
    fn flush_ruleset(&mut self) -> FirewallResult<()>;
}

/// Renders and applies one compiled rule
pub trait RuleEmitter {
    fn emit(&mut self, table: &TableSpec, chain: &ChainSpec, rule: &CompiledRule) -> FirewallResult<()>;
}

/// A complete backend
pub trait Backend: RulesetControl + RuleEmitter {}

impl<T: RulesetControl + RuleEmitter> Backend for T {}

/// IPv4 header matches only make sense in tables that see IPv4 packets
pub(crate) fn check_family(family: Family, rule: &CompiledRule) -> FirewallResult<()> {
    if !matches!(family, Family::Ip6 | Family::Arp) {
        return Ok(());
    }
    match rule
        .matches
        .iter()
        .find(|step| step.field.operand_kind() == OperandKind::Ipv4)
    {
        Some(step) => Err(FirewallError::UnsupportedFormat(format!(
            "'{}' cannot match in a {} table",
            step.field.nft_selector(),
            family
        ))),
        None => Ok(()),
    }
}
