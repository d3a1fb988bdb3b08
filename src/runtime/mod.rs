//! Worker spawners: OS threads, or the Tokio blocking pool.

pub mod thread_spawner;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

pub use thread_spawner::ThreadSpawner;
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::TokioSpawner;
