//! Worker-side handle to an account held by the supervisor.

use serde::{Deserialize, Serialize};

use crate::account::account::{Account, AccountId, PrivateKey};
use crate::core::error::ProxyError;
use crate::host::Host;
use crate::infra::pipe::WorkerPipe;
use crate::infra::protocol::{Request, Response};

/// Credentials of an account at the time it was acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Account id.
    pub id: AccountId,
    /// Login name.
    pub name: String,
    /// Login password.
    pub password: String,
    /// Password for privilege escalation (falls back to the login password).
    pub authorization_password: String,
    /// Private key, if any.
    pub key: Option<PrivateKey>,
}

impl From<&Account> for AccountSnapshot {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id(),
            name: account.name(),
            password: account.password(),
            authorization_password: account.authorization_password(),
            key: account.key(),
        }
    }
}

/// An account acquired through the worker pipe.
///
/// The supervisor holds the real lock under the job's owner token; whatever is still held
/// when the job ends is released automatically.
#[derive(Debug)]
pub struct AccountProxy {
    pipe: WorkerPipe,
    snapshot: AccountSnapshot,
    held: bool,
}

fn expect_account(response: Response) -> Result<AccountSnapshot, ProxyError> {
    match response {
        Response::Account(snapshot) => Ok(snapshot),
        other => Err(ProxyError::UnexpectedResponse(format!("{other:?}"))),
    }
}

impl AccountProxy {
    /// Acquire an account from the pool serving `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor failed to provide an account.
    pub fn for_host(pipe: WorkerPipe, host: &Host) -> Result<Self, ProxyError> {
        let snapshot = expect_account(pipe.call(Request::AcquireAccountForHost(host.clone()))?)?;
        Ok(Self {
            pipe,
            snapshot,
            held: true,
        })
    }

    /// Acquire the account with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor failed to provide the account.
    pub fn for_account(pipe: WorkerPipe, id: AccountId) -> Result<Self, ProxyError> {
        let snapshot = expect_account(pipe.call(Request::AcquireAccount { account: Some(id) })?)?;
        Ok(Self {
            pipe,
            snapshot,
            held: true,
        })
    }

    /// Acquire any account from the default pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor failed to provide an account.
    pub fn for_random_account(pipe: WorkerPipe) -> Result<Self, ProxyError> {
        let snapshot = expect_account(pipe.call(Request::AcquireAccount { account: None })?)?;
        Ok(Self {
            pipe,
            snapshot,
            held: true,
        })
    }

    /// Re-acquire the same account after [`AccountProxy::release`]. No-op while held.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor failed to lock the account.
    pub fn acquire(&mut self) -> Result<(), ProxyError> {
        if self.held {
            return Ok(());
        }
        self.snapshot = expect_account(self.pipe.call(Request::AcquireAccount {
            account: Some(self.snapshot.id),
        })?)?;
        self.held = true;
        Ok(())
    }

    /// Release the account. No-op if already released.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if the supervisor failed to release it.
    pub fn release(&mut self) -> Result<(), ProxyError> {
        if !self.held {
            return Ok(());
        }
        self.pipe.call_ok(Request::ReleaseAccount(self.snapshot.id))?;
        self.held = false;
        Ok(())
    }

    /// Whether this proxy currently holds the account.
    pub const fn is_held(&self) -> bool {
        self.held
    }

    /// Credentials as of the last acquisition.
    pub const fn snapshot(&self) -> &AccountSnapshot {
        &self.snapshot
    }

    /// Account id.
    pub const fn id(&self) -> AccountId {
        self.snapshot.id
    }

    /// Login name.
    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    /// Login password.
    pub fn password(&self) -> &str {
        &self.snapshot.password
    }

    /// Password for privilege escalation.
    pub fn authorization_password(&self) -> &str {
        &self.snapshot.authorization_password
    }

    /// Private key, if any.
    pub const fn key(&self) -> Option<&PrivateKey> {
        self.snapshot.key.as_ref()
    }
}
