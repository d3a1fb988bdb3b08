//! # hostqueue
//!
//! Bounded-concurrency job scheduling for operations run against many network hosts, with
//! exclusive login accounts and per-attempt logs.
//!
//! Each job runs on a worker obtained from a [`Spawn`](core::worker::Spawn) implementation
//! (OS threads by default, the Tokio blocking pool with the `tokio-runtime` feature). A
//! supervisor thread per job drives its retries, serves its account and logger requests over
//! a duplex pipe and turns every failure into an event, so the dispatch loop never sees a user
//! error.
//!
//! ## Building blocks
//!
//! - [`core::event::Event`]: publish/subscribe with strong and weak subscribers
//! - [`core::pipeline::Pipeline`]: FIFO queue with a concurrency limit, priority and forced
//!   items, and sleep/wake of running items
//! - [`core::workqueue::WorkQueue`]: the scheduler, with lifecycle events and retries
//! - [`account::AccountPool`] and [`account::AccountManager`]: exclusive credentials, handed
//!   out in order of release and tracked per owner
//! - [`log::Logger`] and [`log::FileLogger`]: one record per job attempt
//! - [`queue::Queue`]: the per-host batch API tying everything together
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostqueue::account::Account;
//! use hostqueue::builders::build_queue;
//! use hostqueue::config::QueueConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! hostqueue::util::init_tracing();
//! let queue = build_queue(
//!     &QueueConfig::new()
//!         .with_max_threads(8)
//!         .with_attempts(3)
//!         .with_logdir("/tmp/hostqueue-logs"),
//! )?;
//! queue.add_account(Arc::new(Account::new("admin", "secret")));
//!
//! let task = queue.run(["router1", "router2", "switch1"], |ctx, host, account| {
//!     let account = account.ok_or_else(|| anyhow::anyhow!("no account for {host}"))?;
//!     ctx.log(&format!("logging into {host} as {}\n", account.name))?;
//!     Ok(())
//! })?;
//! task.wait();
//! queue.shutdown(false);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Scheduling core: events, the pipeline, jobs, workers and the work queue.
pub mod core;

/// Accounts, account pools and the account manager.
pub mod account;

/// Job log sinks.
pub mod log;

/// Worker pipe, its protocol and the supervisor-side services.
pub mod infra;

/// Worker spawners.
pub mod runtime;

/// Configuration models.
pub mod config;

/// Builders from configuration.
pub mod builders;

/// Telemetry and clock helpers.
pub mod util;

/// Target host model.
pub mod host;

/// Per-host batch API.
pub mod queue;
