use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::ruleset::{ChainPolicy, ChainSpec, Family, TableSpec};

/// Which emitter applies compiled rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Run `nft` commands
    #[default]
    Text,
    /// Submit register operations over netlink
    Netlink,
    /// Compile against the in-memory engine and print the result
    DryRun,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Emitter used to apply rules
    pub backend: BackendKind,

    /// Table the rules live in
    pub table: TableSpec,

    /// Base chain the rules are appended to
    pub chain: ChainSpec,

    /// `nft` executable used by the text backend
    pub nft_path: String,

    /// Allow/deny-list and IPS reload script
    pub list_script: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            table: TableSpec::new(Family::Ip, "filter"),
            chain: ChainSpec::forward_filter("forward", ChainPolicy::Accept),
            nft_path: "nft".to_string(),
            list_script: default_list_script(),
        }
    }
}

/// `shell/suricata_vtysh.sh` next to the running executable
pub fn default_list_script() -> PathBuf {
    let relative = PathBuf::from("shell").join("suricata_vtysh.sh");
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&relative)))
        .unwrap_or(relative)
}
