//! A single credential with its own mutual-exclusion lock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::error::AccountError;
use crate::core::event::Event;

/// Process-unique account identifier.
pub type AccountId = u64;

static NEXT_ACCOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// Private key used for key-based authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    /// Key algorithm, `rsa` or `dss`.
    pub keytype: String,
    /// Path to the key file.
    pub filename: Option<PathBuf>,
    /// Passphrase protecting the key.
    pub passphrase: Option<String>,
}

impl PrivateKey {
    /// A key of type `keytype` without file or passphrase.
    pub fn new(keytype: impl Into<String>) -> Self {
        Self {
            keytype: keytype.into(),
            filename: None,
            passphrase: None,
        }
    }

    /// A key read from `filename`.
    pub fn from_file(filename: impl AsRef<Path>, keytype: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.as_ref().to_path_buf()),
            ..Self::new(keytype)
        }
    }

    /// Set the passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

#[derive(Clone)]
struct Credentials {
    name: String,
    password: String,
    authorization_password: Option<String>,
    key: Option<PrivateKey>,
}

#[derive(Default)]
struct LockState {
    locked: bool,
    holder: Option<ThreadId>,
}

/// A credential shared between jobs.
///
/// Accounts are normally handed out by an [`AccountPool`](crate::account::AccountPool), but they
/// may also be locked directly; pools observe the `acquired` and `released` events to stay
/// consistent with direct locking.
pub struct Account {
    id: AccountId,
    needs_lock: bool,
    credentials: Mutex<Credentials>,
    lock: Mutex<LockState>,
    freed: Condvar,
    acquired: Event<AccountId>,
    released: Event<AccountId>,
    changed: Event<AccountId>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Create an account that must be locked before use.
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: NEXT_ACCOUNT_ID.fetch_add(1, Ordering::Relaxed),
            needs_lock: true,
            credentials: Mutex::new(Credentials {
                name: name.into(),
                password: password.into(),
                authorization_password: None,
                key: None,
            }),
            lock: Mutex::new(LockState::default()),
            freed: Condvar::new(),
            acquired: Event::new(),
            released: Event::new(),
            changed: Event::new(),
        }
    }

    /// Set the password used for privilege escalation.
    #[must_use]
    pub fn with_authorization_password(self, password: impl Into<String>) -> Self {
        self.credentials.lock().authorization_password = Some(password.into());
        self
    }

    /// Attach a private key.
    #[must_use]
    pub fn with_key(self, key: PrivateKey) -> Self {
        self.credentials.lock().key = Some(key);
        self
    }

    /// Make `acquire` and `release` no-ops, so any number of jobs may use the account at once.
    #[must_use]
    pub const fn without_lock(mut self) -> Self {
        self.needs_lock = false;
        self
    }

    /// Account id.
    pub const fn id(&self) -> AccountId {
        self.id
    }

    /// Whether the account is subject to locking.
    pub const fn needs_lock(&self) -> bool {
        self.needs_lock
    }

    /// Fired with the account id after every signalled acquisition.
    pub const fn acquired_event(&self) -> &Event<AccountId> {
        &self.acquired
    }

    /// Fired with the account id after every signalled release.
    pub const fn released_event(&self) -> &Event<AccountId> {
        &self.released
    }

    /// Fired with the account id whenever a credential changes.
    pub const fn changed_event(&self) -> &Event<AccountId> {
        &self.changed
    }

    /// Login name.
    pub fn name(&self) -> String {
        self.credentials.lock().name.clone()
    }

    /// Login password.
    pub fn password(&self) -> String {
        self.credentials.lock().password.clone()
    }

    /// Password for privilege escalation, falling back to the login password.
    pub fn authorization_password(&self) -> String {
        let creds = self.credentials.lock();
        creds
            .authorization_password
            .clone()
            .unwrap_or_else(|| creds.password.clone())
    }

    /// Private key, if any.
    pub fn key(&self) -> Option<PrivateKey> {
        self.credentials.lock().key.clone()
    }

    /// Change the login name.
    pub fn set_name(&self, name: impl Into<String>) {
        self.credentials.lock().name = name.into();
        self.changed.emit(&self.id);
    }

    /// Change the login password.
    pub fn set_password(&self, password: impl Into<String>) {
        self.credentials.lock().password = password.into();
        self.changed.emit(&self.id);
    }

    /// Change the authorization password. `None` falls back to the login password.
    pub fn set_authorization_password(&self, password: Option<String>) {
        self.credentials.lock().authorization_password = password;
        self.changed.emit(&self.id);
    }

    /// Whether some thread holds the account.
    pub fn is_locked(&self) -> bool {
        self.needs_lock && self.lock.lock().locked
    }

    /// Whether the calling thread holds the account.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.needs_lock && self.lock.lock().holder == Some(thread::current().id())
    }

    /// Block until the account is free, then lock it.
    ///
    /// Emits the `acquired` event when `signal` is set.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::AlreadyHeld`] if the calling thread holds the account already.
    pub fn acquire(&self, signal: bool) -> Result<(), AccountError> {
        if !self.needs_lock {
            return Ok(());
        }
        let me = thread::current().id();
        let mut st = self.lock.lock();
        if st.holder == Some(me) {
            return Err(AccountError::AlreadyHeld(self.name()));
        }
        while st.locked {
            self.freed.wait(&mut st);
        }
        st.locked = true;
        st.holder = Some(me);
        drop(st);
        trace!(account_id = self.id, "account acquired");
        if signal {
            self.acquired.emit(&self.id);
        }
        Ok(())
    }

    /// Lock the account if it is free.
    ///
    /// Returns `Ok(false)` when another thread holds it.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::AlreadyHeld`] if the calling thread holds the account already.
    pub fn try_acquire(&self, signal: bool) -> Result<bool, AccountError> {
        if !self.needs_lock {
            return Ok(true);
        }
        let me = thread::current().id();
        let mut st = self.lock.lock();
        if st.holder == Some(me) {
            return Err(AccountError::AlreadyHeld(self.name()));
        }
        if st.locked {
            return Ok(false);
        }
        st.locked = true;
        st.holder = Some(me);
        drop(st);
        if signal {
            self.acquired.emit(&self.id);
        }
        Ok(true)
    }

    /// Unlock the account. Any thread may release it.
    ///
    /// Emits the `released` event when `signal` is set.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::NotLocked`] if the account is not locked.
    pub fn release(&self, signal: bool) -> Result<(), AccountError> {
        if !self.needs_lock {
            return Ok(());
        }
        let mut st = self.lock.lock();
        if !st.locked {
            return Err(AccountError::NotLocked(self.name()));
        }
        st.locked = false;
        st.holder = None;
        drop(st);
        self.freed.notify_all();
        trace!(account_id = self.id, "account released");
        if signal {
            self.released.emit(&self.id);
        }
        Ok(())
    }

    /// Acquire the account and release it when the guard drops.
    ///
    /// # Errors
    ///
    /// Same as [`Account::acquire`].
    pub fn lock(&self) -> Result<AccountGuard<'_>, AccountError> {
        self.acquire(true)?;
        Ok(AccountGuard { account: self })
    }
}

/// Releases its account when dropped.
#[derive(Debug)]
pub struct AccountGuard<'a> {
    account: &'a Account,
}

impl std::ops::Deref for AccountGuard<'_> {
    type Target = Account;

    fn deref(&self) -> &Account {
        self.account
    }
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        let _ = self.account.release(true);
    }
}
