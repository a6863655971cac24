use log::{debug, info};

use crate::compiler::step::{Comparison, CompiledRule, MatchStep, SetSpec, Verdict};
use crate::emit::{check_family, RuleEmitter, RulesetControl};
use crate::models::ruleset::{ChainSpec, Family, TableSpec};
use crate::utils::command::{CommandLine, CommandRunner};
use crate::utils::error::{FirewallError, FirewallResult};

/// Emits rules by running the `nft` command-line tool
#[derive(Debug)]
pub struct TextBackend<R: CommandRunner> {
    runner: R,
    nft: String,
}

impl<R: CommandRunner> TextBackend<R> {
    pub fn new(runner: R, nft: impl Into<String>) -> Self {
        Self {
            runner,
            nft: nft.into(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    fn nft(&self) -> CommandLine {
        CommandLine::new(self.nft.as_str())
    }
}

impl<R: CommandRunner> RulesetControl for TextBackend<R> {
    fn list_tables(&mut self, family: Family) -> FirewallResult<Vec<String>> {
        let cmd = self.nft().args(["list", "tables", family.as_str()]);
        let out = self.runner.run(&cmd)?;
        Ok(parse_tables(&out, family))
    }

    fn list_chains(&mut self, table: &TableSpec) -> FirewallResult<Vec<String>> {
        let cmd = self.nft().args(["list", "chains", table.family.as_str()]);
        let out = self.runner.run(&cmd)?;
        Ok(parse_chains(&out, table))
    }

    fn create_table(&mut self, table: &TableSpec) -> FirewallResult<()> {
        let cmd = self
            .nft()
            .args(["add", "table", table.family.as_str(), table.name.as_str()]);
        self.runner.run(&cmd)?;
        Ok(())
    }

    fn create_chain(&mut self, table: &TableSpec, chain: &ChainSpec) -> FirewallResult<()> {
        // One argument, so a negative priority is never read as an nft option
        let body = format!(
            "{{ type {} hook {} priority {} ; policy {} ; }}",
            chain.chain_type.as_str(),
            chain.hook.as_str(),
            chain.priority,
            chain.policy.as_str()
        );
        let cmd = self.nft().args([
            "add",
            "chain",
            table.family.as_str(),
            table.name.as_str(),
            chain.name.as_str(),
            body.as_str(),
        ]);
        self.runner.run(&cmd)?;
        Ok(())
    }

    fn flush_ruleset(&mut self) -> FirewallResult<()> {
        let cmd = self.nft().args(["flush", "ruleset"]);
        self.runner.run(&cmd)?;
        Ok(())
    }
}

impl<R: CommandRunner> RuleEmitter for TextBackend<R> {
    fn emit(&mut self, table: &TableSpec, chain: &ChainSpec, rule: &CompiledRule) -> FirewallResult<()> {
        let cmd = rule_command(&self.nft, table, &chain.name, rule)?;
        info!("Adding rule: {}", cmd);
        self.runner.run(&cmd)?;
        Ok(())
    }
}

/// `nft add rule <family> <table> <chain> ...` for a compiled rule.
///
/// Selector keywords are separate arguments; each value is a single argument, so
/// nothing a policy supplies is re-tokenized by a shell.
pub fn rule_command(
    nft: &str,
    table: &TableSpec,
    chain: &str,
    rule: &CompiledRule,
) -> FirewallResult<CommandLine> {
    check_family(table.family, rule)?;

    let mut cmd = CommandLine::new(nft).args([
        "add",
        "rule",
        table.family.as_str(),
        table.name.as_str(),
        chain,
    ]);

    for step in &rule.matches {
        cmd = cmd
            .args(step.field.nft_selector().split_whitespace())
            .arg(value(step, &rule.sets)?);
    }

    if let Some(log) = &rule.log {
        cmd = cmd.args([
            "log".to_string(),
            "prefix".to_string(),
            format!("\"{}\"", log.prefix),
            "group".to_string(),
            log.group.to_string(),
            "snaplen".to_string(),
            log.snaplen.to_string(),
            "queue-threshold".to_string(),
            log.queue_threshold.to_string(),
        ]);
    }

    cmd = match rule.verdict {
        Verdict::Queue { num } => cmd.args(["queue".to_string(), "num".to_string(), num.to_string()]),
        Verdict::Drop => cmd.arg("drop"),
    };

    debug!("Rendered {} rule arguments", cmd.arg_list().len());
    Ok(cmd)
}

fn value(step: &MatchStep, sets: &[SetSpec]) -> FirewallResult<String> {
    Ok(match &step.comparison {
        Comparison::Equals(operand) => operand.to_string(),
        Comparison::Range { from, to } => format!("{}-{}", from, to),
        Comparison::Member(index) => {
            let set = sets.get(*index).ok_or_else(|| {
                FirewallError::parse(format!("{:?} refers to missing set {}", step.field, index))
            })?;
            anonymous_set(set)
        }
    })
}

/// Inline `{ a, b-c }` set
fn anonymous_set(set: &SetSpec) -> String {
    let elements: Vec<String> = set
        .elements
        .iter()
        .map(|e| match &e.key_end {
            Some(end) if *end != e.key => format!("{}-{}", e.key, end),
            _ => e.key.to_string(),
        })
        .collect();
    format!("{{ {} }}", elements.join(", "))
}

/// Names from `nft list tables <family>` output (`table ip filter` lines)
fn parse_tables(output: &str, family: Family) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("table"), Some(f), Some(name)) if f == family.as_str() => {
                    Some(name.trim_end_matches('{').trim().to_string())
                }
                _ => None,
            }
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Chains of one table from `nft list chains <family>` output
fn parse_chains(output: &str, table: &TableSpec) -> Vec<String> {
    let mut chains = Vec::new();
    let mut in_table = false;

    for line in output.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["table", family, name, ..] => {
                in_table = *family == table.family.as_str() && *name == table.name;
            }
            ["chain", name, ..] if in_table => chains.push(name.to_string()),
            _ => {}
        }
    }
    chains
}
