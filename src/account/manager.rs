//! Routes account requests to the pool responsible for a host.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::account::account::{Account, AccountId};
use crate::account::owner::OwnerToken;
use crate::account::pool::AccountPool;
use crate::core::error::AccountError;
use crate::host::Host;

/// Predicate selecting the hosts a pool serves.
pub type HostMatch = Arc<dyn Fn(&Host) -> bool + Send + Sync>;

struct Pools {
    default: AccountPool,
    matched: Vec<(HostMatch, AccountPool)>,
}

impl Pools {
    fn all(&self) -> Vec<AccountPool> {
        self.matched
            .iter()
            .map(|(_, pool)| pool.clone())
            .chain(std::iter::once(self.default.clone()))
            .collect()
    }
}

/// A default pool plus an ordered list of host-matched pools.
///
/// Exactly one pool is consulted per acquisition: the first whose predicate accepts the host,
/// otherwise the default pool. Pools are cloned out of the list before blocking, so adding
/// pools never waits on an acquisition.
pub struct AccountManager {
    pools: RwLock<Pools>,
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools = self.pools.read();
        f.debug_struct("AccountManager")
            .field("default", &pools.default)
            .field("matched", &pools.matched.len())
            .finish()
    }
}

impl AccountManager {
    /// Create a manager with an empty default pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(Pools {
                default: AccountPool::new(),
                matched: Vec::new(),
            }),
        }
    }

    /// Register `pool`. Without a predicate it replaces the default pool.
    pub fn add_pool(&self, pool: AccountPool, matches: Option<HostMatch>) {
        let mut pools = self.pools.write();
        match matches {
            Some(matches) => pools.matched.push((matches, pool)),
            None => pools.default = pool,
        }
    }

    /// Add `account` to the default pool.
    pub fn add_account(&self, account: Arc<Account>) {
        let pool = self.pools.read().default.clone();
        pool.add_account(account);
    }

    /// The pool responsible for `host`.
    pub fn pool_for(&self, host: &Host) -> AccountPool {
        let pools = self.pools.read();
        pools
            .matched
            .iter()
            .find(|(matches, _)| matches(host))
            .map_or_else(|| pools.default.clone(), |(_, pool)| pool.clone())
    }

    /// The default pool.
    pub fn default_pool(&self) -> AccountPool {
        self.pools.read().default.clone()
    }

    /// Total number of accounts across all pools.
    pub fn n_accounts(&self) -> usize {
        self.pools.read().all().iter().map(AccountPool::n_accounts).sum()
    }

    /// Find an account by id in any pool.
    pub fn get_account(&self, id: AccountId) -> Option<Arc<Account>> {
        self.pools
            .read()
            .all()
            .iter()
            .find_map(|pool| pool.get_account(id))
    }

    /// Find an account by login name in any pool.
    pub fn get_account_from_name(&self, name: &str) -> Option<Arc<Account>> {
        self.pools
            .read()
            .all()
            .iter()
            .find_map(|pool| pool.get_account_from_name(name))
    }

    /// Acquire an account from the pool responsible for `host`.
    ///
    /// # Errors
    ///
    /// Propagates the pool's [`AccountError`].
    pub fn acquire_account_for(
        &self,
        host: &Host,
        owner: &OwnerToken,
    ) -> Result<Arc<Account>, AccountError> {
        let pool = self.pool_for(host);
        debug!(host = %host, owner = %owner, "acquiring account for host");
        pool.acquire_account(None, owner)
    }

    /// Acquire `account` from whichever pool holds it, or any account from the default pool.
    ///
    /// An account that belongs to no pool is locked directly and is not tracked under
    /// `owner`; the caller must release it itself.
    ///
    /// # Errors
    ///
    /// Propagates the pool's [`AccountError`].
    pub fn acquire_account(
        &self,
        account: Option<&Arc<Account>>,
        owner: &OwnerToken,
    ) -> Result<Arc<Account>, AccountError> {
        let Some(account) = account else {
            return self.default_pool().acquire_account(None, owner);
        };
        let home = self
            .pools
            .read()
            .all()
            .into_iter()
            .find(|pool| pool.has_account(account.id()));
        match home {
            Some(pool) => pool.acquire_account(Some(account.as_ref()), owner),
            None => {
                debug!(account_id = account.id(), "locking unmanaged account directly");
                account.acquire(true)?;
                Ok(Arc::clone(account))
            }
        }
    }

    /// Release everything `owner` holds in any pool.
    pub fn release_accounts(&self, owner: &OwnerToken) {
        let pools = self.pools.read().all();
        for pool in pools {
            match pool.release_accounts(owner) {
                Ok(()) | Err(AccountError::NoSuchOwner(_)) => {}
                Err(err) => debug!(owner = %owner, error = %err, "release failed"),
            }
        }
    }

    /// Release the account `id`, which must be held by `owner` in the pool it belongs to.
    ///
    /// # Errors
    ///
    /// [`AccountError::UnknownAccount`] if no pool holds `id`, otherwise the pool's error.
    pub fn release_account(&self, id: AccountId, owner: &OwnerToken) -> Result<(), AccountError> {
        let home = self
            .pools
            .read()
            .all()
            .into_iter()
            .find(|pool| pool.has_account(id));
        match home {
            Some(pool) => pool.release_account(id, owner),
            None => Err(AccountError::UnknownAccount(id.to_string())),
        }
    }

    /// Fail every pending and later acquisition by `owner` until it releases its accounts.
    pub fn abort(&self, owner: &OwnerToken) {
        let pools = self.pools.read().all();
        for pool in pools {
            pool.abort(owner);
        }
    }

    /// Reset every pool and drop the specialized ones.
    pub fn reset(&self) {
        let mut pools = self.pools.write();
        for pool in pools.all() {
            pool.reset();
        }
        pools.matched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(names: &[&str]) -> AccountPool {
        AccountPool::with_accounts(names.iter().map(|n| Arc::new(Account::new(*n, "pw"))))
    }

    #[test]
    fn test_first_matching_pool_wins() {
        let manager = AccountManager::new();
        manager.add_pool(pool_of(&["default"]), None);
        manager.add_pool(
            pool_of(&["ssh"]),
            Some(Arc::new(|h: &Host| h.protocol() == "ssh")),
        );
        manager.add_pool(
            pool_of(&["router"]),
            Some(Arc::new(|h: &Host| h.name().starts_with("router"))),
        );
        let owner = OwnerToken::from("x");

        let ssh = Host::from_uri("ssh://router1");
        assert_eq!(manager.acquire_account_for(&ssh, &owner).unwrap().name(), "ssh");
        let telnet = Host::new("router2");
        assert_eq!(manager.acquire_account_for(&telnet, &owner).unwrap().name(), "router");
        let other = Host::new("switch1");
        assert_eq!(manager.acquire_account_for(&other, &owner).unwrap().name(), "default");
        assert_eq!(manager.n_accounts(), 3);

        manager.release_accounts(&owner);
        assert_eq!(manager.default_pool().n_unlocked(), 1);
        manager.release_accounts(&owner);
    }

    #[test]
    fn test_specific_account_found_in_matched_pool() {
        let manager = AccountManager::new();
        manager.add_pool(pool_of(&["ssh"]), Some(Arc::new(|_: &Host| false)));
        let ssh = manager.get_account_from_name("ssh").unwrap();
        let owner = OwnerToken::from("x");
        manager.acquire_account(Some(&ssh), &owner).unwrap();
        assert!(ssh.is_locked());
        manager.release_accounts(&owner);
        assert!(!ssh.is_locked());
    }

    #[test]
    fn test_unmanaged_account_is_locked_directly() {
        let manager = AccountManager::new();
        manager.add_account(Arc::new(Account::new("pooled", "pw")));
        let loose = Arc::new(Account::new("loose", "pw"));
        let owner = OwnerToken::from("x");

        let got = manager.acquire_account(Some(&loose), &owner).unwrap();
        assert!(Arc::ptr_eq(&got, &loose));
        assert!(loose.is_locked());
        manager.release_accounts(&owner);
        assert!(loose.is_locked());
        loose.release(true).unwrap();
    }

    #[test]
    fn test_reset_drops_matched_pools() {
        let manager = AccountManager::new();
        manager.add_account(Arc::new(Account::new("a", "pw")));
        manager.add_pool(pool_of(&["b"]), Some(Arc::new(|_: &Host| true)));
        manager.reset();
        assert_eq!(manager.n_accounts(), 0);
        assert_eq!(
            manager
                .acquire_account_for(&Host::new("r"), &OwnerToken::from("x"))
                .unwrap_err(),
            AccountError::EmptyPool
        );
    }
}
