use cbrox::executor::{CommandRunner, ExitOutcome};
use cbrox::launcher::Launcher;
use cbrox::privilege::{Account, AccountDirectory, PrivilegeContext};
use cbrox::reservation::Reserver;
use cbrox::types::{
    AllocationError, CbroxError, IsolationError, LaunchConfig, PrivilegeError, Result,
};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

/// Counts reservations handed out and released
#[derive(Clone, Default)]
struct CountingReserver {
    reserved: Rc<Cell<usize>>,
    released: Rc<Cell<usize>>,
    fail: bool,
}

struct CountedHandle {
    released: Rc<Cell<usize>>,
}

impl Drop for CountedHandle {
    fn drop(&mut self) {
        self.released.set(self.released.get() + 1);
    }
}

impl Reserver for CountingReserver {
    type Handle = CountedHandle;

    fn reserve(&mut self, bytes: u64) -> std::result::Result<CountedHandle, AllocationError> {
        if self.fail {
            return Err(AllocationError::OutOfMemory { requested: bytes });
        }
        self.reserved.set(self.reserved.get() + 1);
        Ok(CountedHandle {
            released: Rc::clone(&self.released),
        })
    }
}

impl CountingReserver {
    fn assert_balanced(&self, expected: usize) {
        assert_eq!(self.reserved.get(), expected, "reservations made");
        assert_eq!(self.released.get(), expected, "reservations released");
    }
}

struct FakeAccounts {
    elevated: bool,
    account: Option<Account>,
    reject_groups: bool,
    reject_switch: bool,
    steps: Vec<&'static str>,
}

impl FakeAccounts {
    fn root() -> Self {
        Self {
            elevated: true,
            account: Some(Account {
                uid: 65534,
                gid: 65534,
            }),
            reject_groups: false,
            reject_switch: false,
            steps: Vec::new(),
        }
    }
}

fn eperm(account: &Account) -> PrivilegeError {
    PrivilegeError::SwitchFailed {
        uid: account.uid,
        reason: "EPERM: Operation not permitted".to_string(),
    }
}

impl AccountDirectory for FakeAccounts {
    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn lookup(&self, _account: &str) -> std::result::Result<Option<Account>, PrivilegeError> {
        Ok(self.account)
    }

    fn clear_groups(&mut self, account: &Account) -> std::result::Result<(), PrivilegeError> {
        if self.reject_groups {
            return Err(eperm(account));
        }
        self.steps.push("setgroups");
        Ok(())
    }

    fn set_gid(&mut self, _account: &Account) -> std::result::Result<(), PrivilegeError> {
        self.steps.push("setgid");
        Ok(())
    }

    fn set_uid(&mut self, account: &Account) -> std::result::Result<(), PrivilegeError> {
        if self.reject_switch {
            return Err(eperm(account));
        }
        self.steps.push("setuid");
        Ok(())
    }
}

/// Records command lines instead of spawning them
struct RecordingRunner {
    calls: Vec<String>,
    outcome: ExitOutcome,
}

impl RecordingRunner {
    fn exiting(code: i32) -> Self {
        Self {
            calls: Vec::new(),
            outcome: ExitOutcome::Exited(code),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&mut self, command_line: &str) -> Result<ExitOutcome> {
        self.calls.push(command_line.to_string());
        Ok(self.outcome)
    }
}

fn sandbox_config(root: &Path) -> LaunchConfig {
    LaunchConfig {
        group_path: root.join("cbrox"),
        ..LaunchConfig::default()
    }
}

const LIMIT: u64 = 50 * 1024 * 1024;

#[test]
fn test_successful_launch() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        FakeAccounts::root(),
        RecordingRunner::exiting(0),
    );

    let outcome = launcher.run("echo hello", LIMIT).expect("launch failed");

    assert_eq!(outcome, ExitOutcome::Exited(0));
    assert_eq!(launcher.runner().calls, vec!["echo hello".to_string()]);
    assert_eq!(
        launcher.context(),
        PrivilegeContext::Demoted {
            uid: 65534,
            gid: 65534
        }
    );
    assert_eq!(launcher.directory().steps, vec!["setgroups", "setgid", "setuid"]);
    assert_eq!(
        fs::read_to_string(root.path().join("cbrox/memory.max")).unwrap(),
        "52428800"
    );
    reserver.assert_balanced(1);
}

#[test]
fn test_relaunch_reuses_existing_group() {
    let root = TempDir::new().expect("Failed to create temp dir");

    for _ in 0..2 {
        let mut launcher = Launcher::new(
            sandbox_config(root.path()),
            CountingReserver::default(),
            FakeAccounts::root(),
            RecordingRunner::exiting(0),
        );
        launcher.run("true", LIMIT).expect("launch failed");
    }
}

#[test]
fn test_not_elevated_touches_nothing() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut accounts = FakeAccounts::root();
    accounts.elevated = false;
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        accounts,
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(matches!(err, CbroxError::PrivilegeRequired), "{:?}", err);
    assert!(!root.path().join("cbrox").exists());
    assert!(launcher.runner().calls.is_empty());
    reserver.assert_balanced(0);
}

#[test]
fn test_reservation_failure_aborts_before_group() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver {
        fail: true,
        ..CountingReserver::default()
    };
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        FakeAccounts::root(),
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(
        matches!(err, CbroxError::Allocation(AllocationError::OutOfMemory { requested }) if requested == LIMIT),
        "{:?}",
        err
    );
    assert!(!root.path().join("cbrox").exists());
    assert!(launcher.runner().calls.is_empty());
    reserver.assert_balanced(0);
}

#[test]
fn test_isolation_failure_releases_reservation() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let config = LaunchConfig {
        group_path: root.path().join("missing-parent").join("cbrox"),
        ..LaunchConfig::default()
    };
    let mut launcher = Launcher::new(
        config,
        reserver.clone(),
        FakeAccounts::root(),
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(
        matches!(err, CbroxError::Isolation(IsolationError::CreateFailed { .. })),
        "{:?}",
        err
    );
    assert_eq!(launcher.context(), PrivilegeContext::Elevated);
    assert!(launcher.runner().calls.is_empty());
    reserver.assert_balanced(1);
}

#[test]
fn test_unknown_account_never_runs_command() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut accounts = FakeAccounts::root();
    accounts.account = None;
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        accounts,
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(
        matches!(err, CbroxError::Privilege(PrivilegeError::UnknownAccount(ref name)) if name == "nobody"),
        "{:?}",
        err
    );
    assert_eq!(launcher.runner().calls.len(), 0);
    reserver.assert_balanced(1);
}

#[test]
fn test_rejected_switch_never_runs_command() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut accounts = FakeAccounts::root();
    accounts.reject_switch = true;
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        accounts,
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(
        matches!(err, CbroxError::Privilege(PrivilegeError::SwitchFailed { uid: 65534, .. })),
        "{:?}",
        err
    );
    assert_eq!(launcher.runner().calls.len(), 0);
    assert_eq!(launcher.context(), PrivilegeContext::Elevated);
    reserver.assert_balanced(1);
}

#[test]
fn test_failing_command_is_execution_failure() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        FakeAccounts::root(),
        RecordingRunner::exiting(1),
    );

    let err = launcher.run("false", LIMIT).unwrap_err();

    assert!(matches!(err, CbroxError::ExecutionFailure { code: 1 }), "{:?}", err);
    assert_eq!(err.exit_code(), 1);
    // Isolation and demotion both completed before the command ran
    assert!(launcher.context().is_demoted());
    assert_eq!(launcher.runner().calls, vec!["false".to_string()]);
    reserver.assert_balanced(1);
}

#[test]
fn test_configured_account_is_used() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let config = LaunchConfig {
        account: "sandbox".to_string(),
        ..sandbox_config(root.path())
    };
    let mut accounts = FakeAccounts::root();
    accounts.account = None;
    let mut launcher = Launcher::new(
        config,
        CountingReserver::default(),
        accounts,
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();
    assert!(
        matches!(err, CbroxError::Privilege(PrivilegeError::UnknownAccount(ref name)) if name == "sandbox"),
        "{:?}",
        err
    );
}

#[test]
fn test_rejected_group_drop_never_runs_command() {
    let root = TempDir::new().expect("Failed to create temp dir");
    let reserver = CountingReserver::default();
    let mut accounts = FakeAccounts::root();
    accounts.reject_groups = true;
    let mut launcher = Launcher::new(
        sandbox_config(root.path()),
        reserver.clone(),
        accounts,
        RecordingRunner::exiting(0),
    );

    let err = launcher.run("true", LIMIT).unwrap_err();

    assert!(
        matches!(err, CbroxError::Privilege(PrivilegeError::SwitchFailed { .. })),
        "{:?}",
        err
    );
    // The uid is never touched once the group drop fails
    assert!(launcher.directory().steps.is_empty());
    assert_eq!(launcher.context(), PrivilegeContext::Elevated);
    assert!(launcher.runner().calls.is_empty());
    reserver.assert_balanced(1);
}
