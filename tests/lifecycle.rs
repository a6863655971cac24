use nft_policy::emit::{BatchBackend, TextBackend};
use nft_policy::models::policy::{Action, Directive, Policy};
use nft_policy::models::ruleset::{ChainPolicy, ChainSpec, Family, TableSpec};
use nft_policy::netfilter::MemoryNetfilter;
use nft_policy::ruleset::{RulesetManager, RulesetState};
use nft_policy::utils::command::RecordingRunner;
use nft_policy::FirewallError;

const EXISTING_CHAINS: &str = "table ip filter {
\tchain forward {
\t\ttype filter hook forward priority filter; policy accept;
\t}
}
";

fn table() -> TableSpec {
    TableSpec::new(Family::Ip, "filter")
}

fn chain() -> ChainSpec {
    ChainSpec::forward_filter("forward", ChainPolicy::Accept)
}

fn drop_policy() -> Policy {
    Policy {
        dest_ips: vec!["10.0.0.1-10.0.0.10".into()],
        action: Action::Drop,
        ..Default::default()
    }
}

fn issued(manager: RulesetManager<TextBackend<RecordingRunner>>) -> Vec<String> {
    manager
        .into_backend()
        .into_runner()
        .commands
        .iter()
        .map(|c| c.arg_list().join(" "))
        .collect()
}

#[test]
fn ordinary_directive_reuses_existing_table_and_chain() {
    let runner = RecordingRunner::new()
        .reply(&["list", "tables"], "table ip filter\n")
        .reply(&["list", "chains"], EXISTING_CHAINS);
    let mut manager = RulesetManager::new(TextBackend::new(runner, "nft"), table(), chain());

    manager.initialize(Directive::Ordinary).unwrap();
    assert_eq!(manager.state(), RulesetState::ChainReady);
    manager.install(&drop_policy()).unwrap();

    assert_eq!(
        issued(manager),
        vec![
            "list tables ip",
            "list chains ip",
            "add rule ip filter forward ip daddr 10.0.0.1-10.0.0.10 drop",
        ]
    );
}

#[test]
fn initialize_directive_flushes_before_creating() {
    let mut manager = RulesetManager::new(TextBackend::new(RecordingRunner::new(), "nft"), table(), chain());
    let mut policy = drop_policy();
    policy.directive = Directive::Initialize;

    manager.install_all(&[policy]).unwrap();

    assert_eq!(
        issued(manager),
        vec![
            "flush ruleset",
            "list tables ip",
            "add table ip filter",
            "list chains ip",
            "add chain ip filter forward { type filter hook forward priority 0 ; policy accept ; }",
            "add rule ip filter forward ip daddr 10.0.0.1-10.0.0.10 drop",
        ]
    );
}

#[test]
fn compiling_before_chain_ready_is_a_precondition_error() {
    let nf = MemoryNetfilter::new();
    let mut manager = RulesetManager::new(BatchBackend::new(nf.clone()), table(), chain());

    let err = manager.install(&drop_policy()).unwrap_err();
    assert!(matches!(err, FirewallError::PreconditionError(_)));
    assert_eq!(nf.commits(), 0);
    assert_eq!(manager.state(), RulesetState::Uninitialized);
}

#[test]
fn parse_errors_leave_the_engine_untouched() {
    let nf = MemoryNetfilter::new();
    let mut manager = RulesetManager::new(BatchBackend::new(nf.clone()), table(), chain());
    manager.initialize(Directive::Ordinary).unwrap();
    let commits = nf.commits();

    let bad = Policy {
        source_ips: vec!["192.168.2.0/255.255.255.0".into()],
        ..Default::default()
    };
    assert!(matches!(
        manager.install(&bad),
        Err(FirewallError::UnsupportedFormat(_))
    ));
    assert_eq!(nf.commits(), commits);
}

#[test]
fn failed_nft_command_is_returned_not_fatal() {
    let runner = RecordingRunner::new().fail_on(&["add", "table"]);
    let mut manager = RulesetManager::new(TextBackend::new(runner, "nft"), table(), chain());

    let err = manager.initialize(Directive::Ordinary).unwrap_err();
    assert!(matches!(err, FirewallError::ExecutionError { .. }));
    assert_ne!(manager.state(), RulesetState::ChainReady);
}

#[cfg(unix)]
mod process {
    use super::*;
    use nft_policy::utils::command::ProcessRunner;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn stand_in_nft_receives_argument_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let nft = dir.path().join("nft");
        write_script(
            &nft,
            &format!("#!/bin/sh\necho \"$*\" >> '{}'\n", log.display()),
        );

        let backend = TextBackend::new(ProcessRunner, nft.to_string_lossy());
        let mut manager = RulesetManager::new(backend, table(), chain());
        manager.initialize(Directive::Initialize).unwrap();
        manager.install(&drop_policy()).unwrap();

        let calls = fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.first(), Some(&"flush ruleset"));
        assert_eq!(
            calls.last(),
            Some(&"add rule ip filter forward ip daddr 10.0.0.1-10.0.0.10 drop")
        );
    }

    #[test]
    fn non_zero_exit_becomes_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let nft = dir.path().join("nft");
        write_script(&nft, "#!/bin/sh\necho 'Error: Could not process rule' >&2\nexit 1\n");

        let backend = TextBackend::new(ProcessRunner, nft.to_string_lossy());
        let mut manager = RulesetManager::new(backend, table(), chain());
        match manager.initialize(Directive::Ordinary) {
            Err(FirewallError::ExecutionError { detail, .. }) => {
                assert!(detail.contains("Could not process rule"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
