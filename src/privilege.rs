/// Privilege checks and the one-way drop to an unprivileged account
use crate::types::{CbroxError, PrivilegeError};
use log::debug;
use nix::unistd::{self, Gid, Uid, User};

/// Effective identity of the launcher. The only transition is Elevated -> Demoted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeContext {
    Elevated,
    Demoted { uid: u32, gid: u32 },
}

impl PrivilegeContext {
    pub fn is_demoted(&self) -> bool {
        matches!(self, PrivilegeContext::Demoted { .. })
    }
}

/// Numeric identity of an account from the passwd database
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Account {
    pub uid: u32,
    pub gid: u32,
}

/// Host identity operations used by the demoter
pub trait AccountDirectory {
    /// Whether the process currently runs with an effective uid of 0
    fn is_elevated(&self) -> bool;

    /// Resolve an account name; `Ok(None)` if no such account exists
    fn lookup(&self, account: &str) -> Result<Option<Account>, PrivilegeError>;

    /// Drop every supplementary group
    fn clear_groups(&mut self, account: &Account) -> Result<(), PrivilegeError>;

    /// Switch the process to the account's primary group
    fn set_gid(&mut self, account: &Account) -> Result<(), PrivilegeError>;

    /// Switch the process to the account's uid
    fn set_uid(&mut self, account: &Account) -> Result<(), PrivilegeError>;
}

/// The real passwd database plus setgroups(2), setgid(2) and setuid(2)
#[derive(Clone, Copy, Debug, Default)]
pub struct HostIdentity;

fn switch_failed(account: &Account, step: &str, e: nix::Error) -> PrivilegeError {
    PrivilegeError::SwitchFailed {
        uid: account.uid,
        reason: format!("{} failed: {}", step, e),
    }
}

impl AccountDirectory for HostIdentity {
    fn is_elevated(&self) -> bool {
        unistd::geteuid().is_root()
    }

    fn lookup(&self, account: &str) -> Result<Option<Account>, PrivilegeError> {
        User::from_name(account)
            .map(|user| {
                user.map(|u| Account {
                    uid: u.uid.as_raw(),
                    gid: u.gid.as_raw(),
                })
            })
            .map_err(|e| PrivilegeError::LookupFailed {
                account: account.to_string(),
                reason: e.to_string(),
            })
    }

    fn clear_groups(&mut self, account: &Account) -> Result<(), PrivilegeError> {
        unistd::setgroups(&[]).map_err(|e| switch_failed(account, "setgroups", e))
    }

    fn set_gid(&mut self, account: &Account) -> Result<(), PrivilegeError> {
        unistd::setgid(Gid::from_raw(account.gid)).map_err(|e| switch_failed(account, "setgid", e))
    }

    fn set_uid(&mut self, account: &Account) -> Result<(), PrivilegeError> {
        unistd::setuid(Uid::from_raw(account.uid)).map_err(|e| switch_failed(account, "setuid", e))
    }
}

/// Reject the invocation unless it started elevated.
pub fn require_elevated<A: AccountDirectory>(directory: &A) -> Result<(), CbroxError> {
    if directory.is_elevated() {
        Ok(())
    } else {
        Err(CbroxError::PrivilegeRequired)
    }
}

/// Tracks the privilege context and performs the irreversible drop.
pub struct Demoter<A: AccountDirectory> {
    directory: A,
    context: PrivilegeContext,
}

impl<A: AccountDirectory> Demoter<A> {
    /// Start in the elevated context; callers check elevation with [`require_elevated`] first.
    pub fn new(directory: A) -> Self {
        Self {
            directory,
            context: PrivilegeContext::Elevated,
        }
    }

    pub fn context(&self) -> PrivilegeContext {
        self.context
    }

    pub fn directory(&self) -> &A {
        &self.directory
    }

    /// Switch to `account`: supplementary groups, then gid, then uid.
    /// A second call fails with [`PrivilegeError::NotElevated`].
    pub fn drop_to(&mut self, account: &str) -> Result<PrivilegeContext, PrivilegeError> {
        if self.context.is_demoted() {
            return Err(PrivilegeError::NotElevated);
        }

        let target = self
            .directory
            .lookup(account)?
            .ok_or_else(|| PrivilegeError::UnknownAccount(account.to_string()))?;

        // The uid goes last: once it is dropped the group calls are refused.
        self.directory.clear_groups(&target)?;
        self.directory.set_gid(&target)?;
        self.directory.set_uid(&target)?;

        self.context = PrivilegeContext::Demoted {
            uid: target.uid,
            gid: target.gid,
        };
        debug!(
            "Dropped privileges to user '{}' (uid {}, gid {})",
            account, target.uid, target.gid
        );
        Ok(self.context)
    }
}
