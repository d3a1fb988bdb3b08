//! Worker boundary plumbing: the duplex pipe, its message protocol and the supervisor-side
//! request handler.

pub mod pipe;
pub mod protocol;
pub mod service;

pub use pipe::{duplex, SupervisorEnd, WorkerPipe};
pub use protocol::{Request, Response, WorkerMessage};
pub use service::Services;
