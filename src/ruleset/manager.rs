use log::{debug, info};

use crate::compiler::step::CompiledRule;
use crate::compiler::Compiler;
use crate::emit::Backend;
use crate::models::policy::{Directive, Policy};
use crate::models::ruleset::{ChainSpec, TableSpec};
use crate::utils::error::{FirewallError, FirewallResult};

/// Readiness of the target table/chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesetState {
    Uninitialized,
    TableReady,
    ChainReady,
}

/// Owns the table/chain pair rules are installed into.
///
/// The existence check and creation are not transactional: concurrent managers
/// targeting the same engine must be serialized by the caller.
pub struct RulesetManager<B: Backend> {
    /// Engine the rules are applied to
    backend: B,

    /// Target table
    table: TableSpec,

    /// Target base chain
    chain: ChainSpec,

    /// Policy compiler
    compiler: Compiler,

    /// Current lifecycle state
    state: RulesetState,
}

impl<B: Backend> RulesetManager<B> {
    /// Create a manager; nothing is queried until [`initialize`](Self::initialize)
    pub fn new(backend: B, table: TableSpec, chain: ChainSpec) -> Self {
        Self {
            backend,
            table,
            chain,
            compiler: Compiler::new(),
            state: RulesetState::Uninitialized,
        }
    }

    /// Use a specific compiler (e.g. one pinned to a date)
    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn state(&self) -> RulesetState {
        self.state
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    pub fn chain(&self) -> &ChainSpec {
        &self.chain
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Bring the table and chain into existence.
    ///
    /// `Initialize` flushes the whole ruleset first; any other directive reuses what
    /// exists.
    pub fn initialize(&mut self, directive: Directive) -> FirewallResult<()> {
        if directive.forces_flush() {
            info!("Flushing ruleset");
            self.backend.flush_ruleset()?;
            self.state = RulesetState::Uninitialized;
        }

        self.ensure_table()?;
        self.ensure_chain()
    }

    fn ensure_table(&mut self) -> FirewallResult<()> {
        let tables = self.backend.list_tables(self.table.family)?;
        if tables.iter().any(|t| *t == self.table.name) {
            debug!("Reusing table {} {}", self.table.family, self.table.name);
        } else {
            info!("Creating table {} {}", self.table.family, self.table.name);
            self.backend.create_table(&self.table)?;
        }
        self.state = RulesetState::TableReady;
        Ok(())
    }

    fn ensure_chain(&mut self) -> FirewallResult<()> {
        let chains = self.backend.list_chains(&self.table)?;
        if chains.iter().any(|c| *c == self.chain.name) {
            debug!("Reusing chain {}", self.chain.name);
        } else {
            info!(
                "Creating chain {} (hook {}, policy {})",
                self.chain.name,
                self.chain.hook.as_str(),
                self.chain.policy.as_str()
            );
            self.backend.create_chain(&self.table, &self.chain)?;
        }
        self.state = RulesetState::ChainReady;
        Ok(())
    }

    /// Compile one policy and apply it
    pub fn install(&mut self, policy: &Policy) -> FirewallResult<CompiledRule> {
        if self.state != RulesetState::ChainReady {
            return Err(FirewallError::PreconditionError(format!(
                "chain {} is not ready (state {:?}); initialize first",
                self.chain.name, self.state
            )));
        }

        let rule = self.compiler.compile(policy)?;
        self.backend.emit(&self.table, &self.chain, &rule)?;
        info!(
            "Installed policy {} (action {}, {} match steps)",
            policy.label(),
            policy.action,
            rule.matches.len()
        );
        Ok(rule)
    }

    /// Initialize per the first policy's directive, then install every policy in order.
    ///
    /// Stops at the first failure; rules installed before it stay in place.
    pub fn install_all(&mut self, policies: &[Policy]) -> FirewallResult<Vec<CompiledRule>> {
        let directive = policies.first().map(|p| p.directive).unwrap_or_default();
        self.initialize(directive)?;

        policies.iter().map(|policy| self.install(policy)).collect()
    }
}
