pub mod expr;
pub mod memory;
pub mod message;
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub mod netlink;

use crate::models::ruleset::{Family, TableSpec};
use crate::utils::error::FirewallResult;

pub use memory::MemoryNetfilter;
pub use message::{Batch, Message};
#[cfg(all(target_os = "linux", feature = "netlink"))]
pub use netlink::NetlinkSession;

/// Session with a filter engine.
///
/// One session serves one caller at a time; batches from different callers must not
/// interleave.
pub trait Netfilter {
    /// Table names of a family
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>>;

    /// Chain names of a table
    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>>;

    /// Set names of a table
    fn list_sets(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>>;

    /// Apply every message of the batch, or none of them
    fn commit(&mut self, batch: Batch) -> FirewallResult<()>;
}
