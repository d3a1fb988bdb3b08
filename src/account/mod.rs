//! Shared credentials: accounts, pools, the host-aware manager and the worker-side proxy.

#[allow(clippy::module_inception)]
pub mod account;
pub mod manager;
pub mod owner;
pub mod pool;
pub mod proxy;

pub use account::{Account, AccountGuard, AccountId, PrivateKey};
pub use manager::{AccountManager, HostMatch};
pub use owner::OwnerToken;
pub use pool::{AccountPool, AccountState};
pub use proxy::{AccountProxy, AccountSnapshot};
