//! Account pool with FIFO-of-release fairness and ownership tracking.
//!
//! The pool is a monitor: one mutex guards the account table, the queue of unlocked accounts
//! and the owner index; one condition variable wakes blocked acquirers after every change.
//!
//! Accounts may also be locked directly, bypassing the pool. The pool listens (weakly) to
//! every member's `acquired` and `released` events and reconciles its table, so an account
//! locked behind its back is never handed out and comes back once released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::account::account::{Account, AccountId};
use crate::account::owner::OwnerToken;
use crate::core::error::AccountError;
use crate::core::event::{handler, Handler};

/// Pool-side view of one member account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountState {
    /// Waiting in the unlocked queue.
    Unlocked,
    /// Held; `owner` is `None` when the account was locked outside the pool.
    Locked {
        /// Owner the pool handed the account to.
        owner: Option<OwnerToken>,
    },
}

struct Slot {
    account: Arc<Account>,
    state: AccountState,
    on_acquired: Handler<AccountId>,
    on_released: Handler<AccountId>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<AccountId, Slot>,
    unlocked: VecDeque<AccountId>,
    owners: HashMap<OwnerToken, Vec<AccountId>>,
    aborted: HashSet<OwnerToken>,
}

impl PoolState {
    fn detach_owner(&mut self, id: AccountId) {
        let Some(Slot {
            state: AccountState::Locked { owner: Some(owner) },
            ..
        }) = self.slots.get(&id)
        else {
            return;
        };
        let owner = owner.clone();
        if let Some(held) = self.owners.get_mut(&owner) {
            held.retain(|a| *a != id);
            if held.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }

    fn take(&mut self, id: AccountId, owner: &OwnerToken) {
        self.unlocked.retain(|a| *a != id);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = AccountState::Locked {
                owner: Some(owner.clone()),
            };
            self.owners.entry(owner.clone()).or_default().push(id);
        }
    }

    fn mark_external(&mut self, id: AccountId) {
        self.detach_owner(id);
        self.unlocked.retain(|a| *a != id);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = AccountState::Locked { owner: None };
        }
    }

    fn on_acquired(&mut self, id: AccountId) {
        if matches!(
            self.slots.get(&id).map(|s| &s.state),
            Some(AccountState::Unlocked)
        ) {
            self.mark_external(id);
        }
    }

    /// Bring a released account back into the unlocked queue, unless someone re-locked it.
    fn reconcile_released(&mut self, id: AccountId) {
        let Some(slot) = self.slots.get(&id) else {
            return;
        };
        if slot.account.is_locked() {
            // Re-locked outside the pool before we got here.
            self.mark_external(id);
            return;
        }
        if slot.state == AccountState::Unlocked {
            return;
        }
        self.detach_owner(id);
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = AccountState::Unlocked;
        }
        self.unlocked.push_back(id);
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolShared {
    fn on_acquired(&self, id: AccountId) {
        self.state.lock().on_acquired(id);
        self.cond.notify_all();
    }

    fn on_released(&self, id: AccountId) {
        self.state.lock().reconcile_released(id);
        self.cond.notify_all();
    }

    fn check_aborted(st: &PoolState, owner: &OwnerToken) -> Result<(), AccountError> {
        if st.aborted.contains(owner) {
            return Err(AccountError::Aborted(owner.to_string()));
        }
        Ok(())
    }
}

/// A managed set of accounts handed out to owners.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct AccountPool {
    shared: Arc<PoolShared>,
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccountPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("AccountPool")
            .field("accounts", &st.slots.len())
            .field("unlocked", &st.unlocked.len())
            .field("owners", &st.owners.len())
            .finish()
    }
}

impl AccountPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a pool holding `accounts`.
    pub fn with_accounts(accounts: impl IntoIterator<Item = Arc<Account>>) -> Self {
        let pool = Self::new();
        pool.add_accounts(accounts);
        pool
    }

    fn subscribe(&self, account: &Account) -> (Handler<AccountId>, Handler<AccountId>) {
        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let on_acquired = handler(move |id: &AccountId| {
            if let Some(shared) = weak.upgrade() {
                shared.on_acquired(*id);
            }
            None
        });
        let weak: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let on_released = handler(move |id: &AccountId| {
            if let Some(shared) = weak.upgrade() {
                shared.on_released(*id);
            }
            None
        });
        if let Err(err) = account.acquired_event().listen(&on_acquired) {
            warn!(account_id = account.id(), error = %err, "pool already listening for acquisitions");
        }
        if let Err(err) = account.released_event().listen(&on_released) {
            warn!(account_id = account.id(), error = %err, "pool already listening for releases");
        }
        (on_acquired, on_released)
    }

    /// Add `account`. Adding a member again has no effect.
    pub fn add_account(&self, account: Arc<Account>) {
        if self.has_account(account.id()) {
            return;
        }
        let (on_acquired, on_released) = self.subscribe(&account);
        let id = account.id();
        let mut st = self.shared.state.lock();
        if st.slots.contains_key(&id) {
            return;
        }
        let state = if account.is_locked() {
            AccountState::Locked { owner: None }
        } else {
            st.unlocked.push_back(id);
            AccountState::Unlocked
        };
        st.slots.insert(
            id,
            Slot {
                account,
                state,
                on_acquired,
                on_released,
            },
        );
        drop(st);
        debug!(account_id = id, "account added to pool");
        self.shared.cond.notify_all();
    }

    /// Add every account in `accounts`.
    pub fn add_accounts(&self, accounts: impl IntoIterator<Item = Arc<Account>>) {
        for account in accounts {
            self.add_account(account);
        }
    }

    /// Whether the account with `id` is a member.
    pub fn has_account(&self, id: AccountId) -> bool {
        self.shared.state.lock().slots.contains_key(&id)
    }

    /// Number of member accounts.
    pub fn n_accounts(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Number of accounts ready to be handed out.
    pub fn n_unlocked(&self) -> usize {
        self.shared.state.lock().unlocked.len()
    }

    /// Pool-side state of the account with `id`.
    pub fn state_of(&self, id: AccountId) -> Option<AccountState> {
        self.shared.state.lock().slots.get(&id).map(|s| s.state.clone())
    }

    /// The member with `id`.
    pub fn get_account(&self, id: AccountId) -> Option<Arc<Account>> {
        self.shared
            .state
            .lock()
            .slots
            .get(&id)
            .map(|s| Arc::clone(&s.account))
    }

    /// The first member whose login name is `name`.
    pub fn get_account_from_name(&self, name: &str) -> Option<Arc<Account>> {
        self.shared
            .state
            .lock()
            .slots
            .values()
            .find(|s| s.account.name() == name)
            .map(|s| Arc::clone(&s.account))
    }

    /// Every member account.
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.shared
            .state
            .lock()
            .slots
            .values()
            .map(|s| Arc::clone(&s.account))
            .collect()
    }

    /// Ids of the accounts `owner` holds.
    pub fn held_by(&self, owner: &OwnerToken) -> Vec<AccountId> {
        self.shared
            .state
            .lock()
            .owners
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    /// Block until an account is free, lock it and record `owner` as its holder.
    ///
    /// With `account` set, waits for that member. Otherwise takes the account that has been
    /// unlocked the longest.
    ///
    /// # Errors
    ///
    /// - [`AccountError::EmptyPool`] if the pool has no members.
    /// - [`AccountError::UnknownAccount`] if `account` is not a member.
    /// - [`AccountError::AlreadyHeld`] if the calling thread holds `account` already.
    /// - [`AccountError::Aborted`] if [`AccountPool::abort`] was called for `owner`.
    pub fn acquire_account(
        &self,
        account: Option<&Account>,
        owner: &OwnerToken,
    ) -> Result<Arc<Account>, AccountError> {
        let acquired = match account {
            Some(account) => self.acquire_specific(account, owner),
            None => self.acquire_next(owner),
        }?;
        debug!(account_id = acquired.id(), owner = %owner, "account acquired from pool");
        Ok(acquired)
    }

    fn acquire_specific(
        &self,
        account: &Account,
        owner: &OwnerToken,
    ) -> Result<Arc<Account>, AccountError> {
        let id = account.id();
        let mut st = self.shared.state.lock();
        if st.slots.is_empty() {
            return Err(AccountError::EmptyPool);
        }
        loop {
            PoolShared::check_aborted(&st, owner)?;
            let Some(slot) = st.slots.get(&id) else {
                return Err(AccountError::UnknownAccount(account.name()));
            };
            let member = Arc::clone(&slot.account);
            if member.is_held_by_current_thread() {
                return Err(AccountError::AlreadyHeld(member.name()));
            }
            if slot.state == AccountState::Unlocked {
                if member.try_acquire(false)? {
                    st.take(id, owner);
                    drop(st);
                    self.shared.cond.notify_all();
                    return Ok(member);
                }
                st.mark_external(id);
            }
            self.shared.cond.wait(&mut st);
        }
    }

    fn acquire_next(&self, owner: &OwnerToken) -> Result<Arc<Account>, AccountError> {
        let mut st = self.shared.state.lock();
        loop {
            PoolShared::check_aborted(&st, owner)?;
            if st.slots.is_empty() {
                return Err(AccountError::EmptyPool);
            }
            while let Some(id) = st.unlocked.pop_front() {
                let Some(member) = st.slots.get(&id).map(|s| Arc::clone(&s.account)) else {
                    continue;
                };
                match member.try_acquire(false) {
                    Ok(true) => {
                        st.take(id, owner);
                        drop(st);
                        self.shared.cond.notify_all();
                        return Ok(member);
                    }
                    Ok(false) | Err(_) => st.mark_external(id),
                }
            }
            self.shared.cond.wait(&mut st);
        }
    }

    /// Make every current and future acquisition by `owner` fail with
    /// [`AccountError::Aborted`], until `owner` releases its accounts.
    pub fn abort(&self, owner: &OwnerToken) {
        self.shared.state.lock().aborted.insert(owner.clone());
        debug!(owner = %owner, "account acquisitions aborted");
        self.shared.cond.notify_all();
    }

    /// Release the member `id`, which must be held by `owner`.
    ///
    /// # Errors
    ///
    /// - [`AccountError::UnknownAccount`] if `id` is not a member.
    /// - [`AccountError::NotLocked`] if the account is not locked.
    /// - [`AccountError::NotHeldBy`] if the account is locked by anyone but `owner`.
    pub fn release_account(&self, id: AccountId, owner: &OwnerToken) -> Result<(), AccountError> {
        let account = {
            let st = self.shared.state.lock();
            let slot = st
                .slots
                .get(&id)
                .ok_or_else(|| AccountError::UnknownAccount(id.to_string()))?;
            match &slot.state {
                AccountState::Locked { owner: Some(o) } if o == owner => {}
                AccountState::Unlocked => return Err(AccountError::NotLocked(slot.account.name())),
                AccountState::Locked { .. } => {
                    return Err(AccountError::NotHeldBy {
                        account: slot.account.name(),
                        owner: owner.to_string(),
                    })
                }
            }
            Arc::clone(&slot.account)
        };
        account.release(false)?;
        let mut st = self.shared.state.lock();
        let owned = matches!(
            st.slots.get(&id).map(|s| &s.state),
            Some(AccountState::Locked { owner: Some(o) }) if o == owner
        );
        if owned {
            st.reconcile_released(id);
        }
        drop(st);
        debug!(account_id = id, owner = %owner, "account released by owner");
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Release every account held by `owner` and lift an [`AccountPool::abort`] for it.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::NoSuchOwner`] if `owner` holds nothing in this pool.
    pub fn release_accounts(&self, owner: &OwnerToken) -> Result<(), AccountError> {
        let held: Vec<Arc<Account>> = {
            let mut st = self.shared.state.lock();
            st.aborted.remove(owner);
            let ids = st
                .owners
                .get(owner)
                .ok_or_else(|| AccountError::NoSuchOwner(owner.to_string()))?;
            ids.iter()
                .filter_map(|id| st.slots.get(id).map(|s| Arc::clone(&s.account)))
                .collect()
        };
        for account in &held {
            if let Err(err) = account.release(false) {
                debug!(account_id = account.id(), error = %err, "account was not locked");
            }
        }
        let mut st = self.shared.state.lock();
        for account in &held {
            let id = account.id();
            let owned = matches!(
                st.slots.get(&id).map(|s| &s.state),
                Some(AccountState::Locked { owner: Some(o) }) if o == owner
            );
            if owned {
                st.reconcile_released(id);
            }
        }
        st.owners.remove(owner);
        drop(st);
        debug!(owner = %owner, released = held.len(), "owner released accounts");
        self.shared.cond.notify_all();
        Ok(())
    }

    /// Release every owner's accounts, unsubscribe from and remove every member.
    ///
    /// Threads blocked in [`AccountPool::acquire_account`] fail with `EmptyPool` or
    /// `UnknownAccount`.
    pub fn reset(&self) {
        let slots: Vec<Slot> = {
            let mut st = self.shared.state.lock();
            st.unlocked.clear();
            st.owners.clear();
            st.aborted.clear();
            st.slots.drain().map(|(_, slot)| slot).collect()
        };
        self.shared.cond.notify_all();
        for slot in slots {
            if matches!(slot.state, AccountState::Locked { owner: Some(_) }) {
                let _ = slot.account.release(false);
            }
            slot.account.acquired_event().disconnect(&slot.on_acquired);
            slot.account.released_event().disconnect(&slot.on_released);
        }
        debug!("account pool reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn accounts(names: &[&str]) -> Vec<Arc<Account>> {
        names
            .iter()
            .map(|n| Arc::new(Account::new(*n, "pw")))
            .collect()
    }

    #[test]
    fn test_empty_pool_fails() {
        let pool = AccountPool::new();
        let owner = OwnerToken::from("x");
        assert_eq!(
            pool.acquire_account(None, &owner).unwrap_err(),
            AccountError::EmptyPool
        );
    }

    #[test]
    fn test_add_account_is_idempotent() {
        let pool = AccountPool::new();
        let a = Arc::new(Account::new("a", "pw"));
        pool.add_account(Arc::clone(&a));
        pool.add_account(Arc::clone(&a));
        assert_eq!(pool.n_accounts(), 1);
        assert_eq!(pool.n_unlocked(), 1);
        assert_eq!(a.acquired_event().n_subscribers(), 1);
    }

    #[test]
    fn test_released_account_goes_last() {
        let pool = AccountPool::with_accounts(accounts(&["a", "b", "c", "d", "abc"]));
        let owner = OwnerToken::from("x");
        let held: Vec<_> = (0..5)
            .map(|_| pool.acquire_account(None, &owner).unwrap())
            .collect();
        assert_eq!(pool.n_unlocked(), 0);

        let abc = held.iter().find(|a| a.name() == "abc").unwrap();
        abc.release(true).unwrap();
        assert_eq!(pool.state_of(abc.id()), Some(AccountState::Unlocked));
        assert_eq!(pool.held_by(&owner).len(), 4);

        let next = pool.acquire_account(None, &owner).unwrap();
        assert_eq!(next.name(), "abc");
    }

    #[test]
    fn test_release_accounts_by_owner() {
        let pool = AccountPool::with_accounts(accounts(&["a", "b", "c"]));
        let owner = OwnerToken::from("X");
        let first = pool.acquire_account(None, &owner).unwrap();
        let second = pool.acquire_account(None, &owner).unwrap();
        assert_eq!(pool.n_unlocked(), 1);

        pool.release_accounts(&owner).unwrap();
        assert!(!first.is_locked());
        assert!(!second.is_locked());
        assert_eq!(pool.n_unlocked(), 3);
        assert!(pool.held_by(&owner).is_empty());
        assert_eq!(
            pool.release_accounts(&owner),
            Err(AccountError::NoSuchOwner("X".into()))
        );
    }

    #[test]
    fn test_specific_account_rules() {
        let pool = AccountPool::with_accounts(accounts(&["a"]));
        let stranger = Account::new("stranger", "pw");
        let owner = OwnerToken::from("x");
        assert_eq!(
            pool.acquire_account(Some(&stranger), &owner).unwrap_err(),
            AccountError::UnknownAccount("stranger".into())
        );

        let a = pool.get_account_from_name("a").unwrap();
        pool.acquire_account(Some(&a), &owner).unwrap();
        assert_eq!(
            pool.acquire_account(Some(&a), &owner).unwrap_err(),
            AccountError::AlreadyHeld("a".into())
        );
    }

    #[test]
    fn test_specific_account_waits_for_release() {
        let pool = AccountPool::with_accounts(accounts(&["a", "b"]));
        let a = pool.get_account_from_name("a").unwrap();
        pool.acquire_account(Some(&a), &OwnerToken::from("first")).unwrap();

        let p = pool.clone();
        let wanted = Arc::clone(&a);
        let waiter = thread::spawn(move || {
            let got = p
                .acquire_account(Some(&wanted), &OwnerToken::from("second"))
                .unwrap();
            got.name()
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        pool.release_accounts(&OwnerToken::from("first")).unwrap();
        assert_eq!(waiter.join().unwrap(), "a");
    }

    #[test]
    fn test_direct_lock_is_reconciled() {
        let pool = AccountPool::with_accounts(accounts(&["a", "b"]));
        let a = pool.get_account_from_name("a").unwrap();
        a.acquire(true).unwrap();
        assert_eq!(pool.state_of(a.id()), Some(AccountState::Locked { owner: None }));

        let owner = OwnerToken::from("x");
        assert_eq!(pool.acquire_account(None, &owner).unwrap().name(), "b");

        a.release(true).unwrap();
        assert_eq!(pool.state_of(a.id()), Some(AccountState::Unlocked));
        assert_eq!(pool.n_unlocked(), 1);
    }

    #[test]
    fn test_silently_locked_account_is_skipped() {
        let pool = AccountPool::with_accounts(accounts(&["a", "b"]));
        let a = pool.get_account_from_name("a").unwrap();
        a.acquire(false).unwrap();
        let got = pool.acquire_account(None, &OwnerToken::from("x")).unwrap();
        assert_eq!(got.name(), "b");
        assert_eq!(pool.state_of(a.id()), Some(AccountState::Locked { owner: None }));
    }

    #[test]
    fn test_release_account_checks_owner() {
        let pool = AccountPool::with_accounts(accounts(&["a"]));
        let a = pool.get_account_from_name("a").unwrap();
        let first = OwnerToken::from("first");
        let second = OwnerToken::from("second");
        assert_eq!(
            pool.release_account(a.id(), &first),
            Err(AccountError::NotLocked("a".into()))
        );

        pool.acquire_account(None, &first).unwrap();
        assert_eq!(
            pool.release_account(a.id(), &second),
            Err(AccountError::NotHeldBy {
                account: "a".into(),
                owner: "second".into()
            })
        );
        assert!(a.is_locked());

        pool.release_account(a.id(), &first).unwrap();
        assert!(!a.is_locked());
        assert!(pool.held_by(&first).is_empty());
        assert_eq!(pool.n_unlocked(), 1);
    }

    #[test]
    fn test_relock_during_owner_release_is_external() {
        let pool = AccountPool::with_accounts(accounts(&["a"]));
        let owner = OwnerToken::from("x");
        let a = pool.acquire_account(None, &owner).unwrap();

        // Someone locks the account directly between its release and the pool catching up.
        a.release(false).unwrap();
        a.acquire(false).unwrap();
        pool.shared.state.lock().reconcile_released(a.id());

        assert_eq!(pool.state_of(a.id()), Some(AccountState::Locked { owner: None }));
        assert!(pool.held_by(&owner).is_empty());
        assert_eq!(pool.n_unlocked(), 0);

        a.release(true).unwrap();
        assert_eq!(pool.state_of(a.id()), Some(AccountState::Unlocked));
    }

    #[test]
    fn test_abort_wakes_waiting_owner() {
        let pool = AccountPool::with_accounts(accounts(&["a"]));
        pool.acquire_account(None, &OwnerToken::from("holder")).unwrap();

        let p = pool.clone();
        let waiter = thread::spawn(move || p.acquire_account(None, &OwnerToken::from("waiter")));
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        pool.abort(&OwnerToken::from("waiter"));
        assert_eq!(
            waiter.join().unwrap().unwrap_err(),
            AccountError::Aborted("waiter".into())
        );
        assert_eq!(pool.held_by(&OwnerToken::from("holder")).len(), 1);

        // Releasing lifts the abort.
        let _ = pool.release_accounts(&OwnerToken::from("waiter"));
        pool.release_accounts(&OwnerToken::from("holder")).unwrap();
        assert!(pool.acquire_account(None, &OwnerToken::from("waiter")).is_ok());
    }

    #[test]
    fn test_reset_unsubscribes() {
        let list = accounts(&["a", "b"]);
        let pool = AccountPool::with_accounts(list.clone());
        pool.acquire_account(None, &OwnerToken::from("x")).unwrap();
        pool.reset();
        assert_eq!(pool.n_accounts(), 0);
        for account in &list {
            assert!(!account.is_locked());
            assert_eq!(account.acquired_event().n_subscribers(), 0);
            assert_eq!(account.released_event().n_subscribers(), 0);
        }
    }

    #[test]
    fn test_dropped_pool_leaves_no_subscribers() {
        let a = Arc::new(Account::new("a", "pw"));
        let pool = AccountPool::with_accounts([Arc::clone(&a)]);
        drop(pool);
        assert_eq!(a.released_event().n_subscribers(), 0);
        a.acquire(true).unwrap();
        a.release(true).unwrap();
    }
}
