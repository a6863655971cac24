use crate::models::ruleset::{ChainSpec, TableSpec};
use crate::netfilter::expr::Expr;

/// A named set as registered with the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDef {
    pub name: String,
    /// Batch-local id lookups refer to before the set has a handle
    pub id: u32,
    /// nft datatype of the key
    pub key_type: u32,
    pub key_len: u32,
    pub interval: bool,
}

/// Encoded set member; `key_end` closes an interval
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementBytes {
    pub key: Vec<u8>,
    pub key_end: Option<Vec<u8>>,
}

/// Typed engine message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Delete every table of every family
    FlushRuleset,
    AddTable(TableSpec),
    AddChain {
        table: TableSpec,
        chain: ChainSpec,
    },
    AddSet {
        table: TableSpec,
        set: SetDef,
        elements: Vec<ElementBytes>,
    },
    AddRule {
        table: TableSpec,
        chain: String,
        exprs: Vec<Expr>,
    },
}

/// Messages committed together; the engine applies all or none
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl From<Message> for Batch {
    fn from(message: Message) -> Self {
        Self {
            messages: vec![message],
        }
    }
}
