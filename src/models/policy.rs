use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::{FirewallError, FirewallResult};

/// One intended filter rule.
///
/// Empty strings, empty lists and zero ports mean "match any"; such fields never
/// produce a match step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Policy name, only used in log output
    pub name: String,

    /// Input interfaces (regions)
    pub source_interfaces: Vec<String>,

    /// Output interfaces (regions)
    pub dest_interfaces: Vec<String>,

    /// Source addresses: literals, `A-B` ranges or `A/n` blocks
    pub source_ips: Vec<String>,

    /// Destination addresses: literals, `A-B` ranges or `A/n` blocks
    pub dest_ips: Vec<String>,

    /// Source MAC address
    pub source_mac: String,

    /// Destination MAC address
    pub dest_mac: String,

    /// Transport protocol name (tcp, udp, icmp, ...)
    pub protocol: String,

    /// Source port, 0 = unset
    pub source_port: u16,

    /// Destination port, 0 = unset
    pub dest_port: u16,

    /// Application label
    pub app: App,

    /// Time windows, all of which must match
    pub times: Vec<TimeWindow>,

    /// Log prefix; no log step when empty
    pub log_tag: String,

    /// Request detailed logging of matched packets
    pub log_detail: bool,

    /// What to do with matching packets
    pub action: Action,

    /// Lifecycle directive for this submission
    pub directive: Directive,
}

impl Policy {
    /// Short human-readable label for log lines
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            "<unnamed>"
        } else {
            &self.name
        }
    }
}

/// Rule action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Hand the packet to the inspection queue
    #[default]
    Allow,
    /// Hand the packet to the inspection queue and raise an alert
    Warn,
    /// Drop the packet
    Drop,
}

impl FromStr for Action {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "allow" | "accept" | "queue" | "0" => Ok(Action::Allow),
            "warn" | "log" | "alert" | "1" => Ok(Action::Warn),
            "drop" | "deny" | "2" => Ok(Action::Drop),
            other => Err(FirewallError::parse(format!("unknown action '{}'", other))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Allow => "allow",
            Action::Warn => "warn",
            Action::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// Lifecycle directive carried by a submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    /// Reuse whatever table/chain state exists
    #[default]
    Ordinary,
    /// Flush the whole ruleset before creating the table/chain
    Initialize,
}

impl Directive {
    pub fn forces_flush(self) -> bool {
        self == Directive::Initialize
    }
}

impl FromStr for Directive {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "ordinary" => Ok(Directive::Ordinary),
            "init" | "initialize" => Ok(Directive::Initialize),
            other => Err(FirewallError::parse(format!("unknown policy directive '{}'", other))),
        }
    }
}

/// Application the policy is meant for. Never compiled into the rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    /// Whether the application is one of the predefined ones
    pub predefined: bool,

    /// Well-known port of the application
    pub port: u16,

    /// Application/protocol name (e.g. modbus)
    pub name: String,
}

/// Time restriction of a policy.
///
/// `day` is an absolute interval and, when present, wins over the recurring keys.
/// `hour` alone is a daily window; together with `month` it bounds every month day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindow {
    /// `YYYY-MM-DD HH:MM:SS-YYYY-MM-DD HH:MM:SS`
    pub day: String,

    /// `HH:MM:SS-HH:MM:SS`
    pub hour: String,

    /// Weekday indices, `0,1,5` (0 = Sunday)
    pub week: String,

    /// Days of month, `1,10-15`
    pub month: String,
}

impl TimeWindow {
    pub fn is_empty(&self) -> bool {
        self.day.is_empty() && self.hour.is_empty() && self.week.is_empty() && self.month.is_empty()
    }
}

/// Parses the command-line form `month=1,10-15;hour=18:00:00-19:00:00`
impl FromStr for TimeWindow {
    type Err = FirewallError;

    fn from_str(s: &str) -> FirewallResult<Self> {
        let mut window = TimeWindow::default();

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| FirewallError::parse(format!("time entry '{}' is not key=value", part)))?;
            let value = value.trim().to_string();

            match key.trim().to_lowercase().as_str() {
                "day" => window.day = value,
                "hour" => window.hour = value,
                "week" => window.week = value,
                "month" => window.month = value,
                other => {
                    return Err(FirewallError::parse(format!("unknown time key '{}'", other)));
                }
            }
        }

        if window.is_empty() {
            return Err(FirewallError::parse(format!("empty time window '{}'", s)));
        }
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_accepts_legacy_names() {
        assert_eq!("accept".parse::<Action>().unwrap(), Action::Allow);
        assert_eq!("LOG".parse::<Action>().unwrap(), Action::Warn);
        assert_eq!("2".parse::<Action>().unwrap(), Action::Drop);
        assert!("reject".parse::<Action>().is_err());
    }

    #[test]
    fn directive_init_forces_flush() {
        assert!("init".parse::<Directive>().unwrap().forces_flush());
        assert!(!Directive::default().forces_flush());
    }

    #[test]
    fn time_window_from_cli_form() {
        let w: TimeWindow = "month=1,10-15; hour=18:00:00-19:00:00".parse().unwrap();
        assert_eq!(w.month, "1,10-15");
        assert_eq!(w.hour, "18:00:00-19:00:00");
        assert!(w.day.is_empty());

        let w: TimeWindow = "day=2022-11-22 18:00:00-2022-11-22 19:00:00".parse().unwrap();
        assert_eq!(w.day, "2022-11-22 18:00:00-2022-11-22 19:00:00");

        assert!("year=2024".parse::<TimeWindow>().is_err());
        assert!("month".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn policy_json_fields_default() {
        let p: Policy =
            serde_json::from_str(r#"{"dest_ips":["10.0.0.1-10.0.0.10"],"action":"drop"}"#).unwrap();
        assert_eq!(p.action, Action::Drop);
        assert_eq!(p.source_port, 0);
        assert!(p.source_ips.is_empty());
        assert_eq!(p.directive, Directive::Ordinary);
    }
}
