//! Compiles declarative network-access policies into nftables rules.
//!
//! A [`Policy`](models::policy::Policy) is compiled once into a backend-agnostic
//! [`CompiledRule`](compiler::step::CompiledRule) and then applied either as an `nft`
//! command ([`emit::TextBackend`]) or as a batch of register operations committed
//! over netlink ([`emit::BatchBackend`]). [`ruleset::RulesetManager`] owns the target
//! table and chain.

pub mod compiler;
pub mod emit;
pub mod lists;
pub mod models;
pub mod netfilter;
pub mod ruleset;
pub mod utils;

pub use utils::error::{FirewallError, FirewallResult};
