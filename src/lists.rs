//! Allow/deny lists of the intrusion-prevention engine.
//!
//! Lists live outside the filter engine and are maintained by an external script
//! invoked as `<script> whitelist|blacklist add <rule>`, `<script> whitelist|blacklist
//! del` and `<script> suricata reload`.

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::command::{CommandLine, CommandRunner};
use crate::utils::error::{FirewallError, FirewallResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl ListKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListKind::Whitelist => "whitelist",
            ListKind::Blacklist => "blacklist",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the list maintenance script
#[derive(Debug)]
pub struct ListScript<R: CommandRunner> {
    runner: R,
    script: PathBuf,
}

impl<R: CommandRunner> ListScript<R> {
    pub fn new(runner: R, script: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            script: script.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn command(&self) -> CommandLine {
        CommandLine::new(self.script.to_string_lossy())
    }

    /// Append a rule to a list
    pub fn add(&mut self, kind: ListKind, rule: &str) -> FirewallResult<()> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(FirewallError::parse(format!("empty {} rule", kind)));
        }
        let cmd = self.command().args([kind.as_str(), "add", rule]);
        self.runner.run(&cmd)?;
        info!("Added {} rule: {}", kind, rule);
        Ok(())
    }

    /// Clear a list
    pub fn delete(&mut self, kind: ListKind) -> FirewallResult<()> {
        let cmd = self.command().args([kind.as_str(), "del"]);
        self.runner.run(&cmd)?;
        info!("Cleared {}", kind);
        Ok(())
    }

    /// Make the inspection engine re-read its lists
    pub fn reload(&mut self) -> FirewallResult<()> {
        let cmd = self.command().args(["suricata", "reload"]);
        self.runner.run(&cmd)?;
        info!("Reloaded inspection engine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::RecordingRunner;

    #[test]
    fn commands_have_fixed_shape() {
        let mut lists = ListScript::new(RecordingRunner::new(), "/opt/fw/shell/suricata_vtysh.sh");
        lists
            .add(ListKind::Whitelist, "pass tcp 10.0.0.1 any -> any 502 (sid:1;)")
            .unwrap();
        lists.delete(ListKind::Blacklist).unwrap();
        lists.reload().unwrap();

        let args: Vec<Vec<String>> = lists
            .runner()
            .commands
            .iter()
            .map(|c| c.arg_list().to_vec())
            .collect();
        assert_eq!(
            args,
            vec![
                vec![
                    "whitelist".to_string(),
                    "add".to_string(),
                    "pass tcp 10.0.0.1 any -> any 502 (sid:1;)".to_string()
                ],
                vec!["blacklist".to_string(), "del".to_string()],
                vec!["suricata".to_string(), "reload".to_string()],
            ]
        );
        assert_eq!(
            lists.runner().commands[0].program(),
            "/opt/fw/shell/suricata_vtysh.sh"
        );
    }

    #[test]
    fn script_failure_propagates() {
        let mut lists = ListScript::new(RecordingRunner::new().fail_on(&["suricata"]), "vtysh.sh");
        assert!(matches!(lists.reload(), Err(FirewallError::ExecutionError { .. })));
        assert!(lists.add(ListKind::Whitelist, "  ").is_err());
    }
}
