//! Messages exchanged between a running job and its supervisor.
//!
//! Every request is answered by exactly one [`Response`] before the next request is sent,
//! so no correlation ids are needed. All messages are serde-serializable, which keeps the
//! protocol usable across a process boundary.

use serde::{Deserialize, Serialize};

use crate::account::account::AccountId;
use crate::account::proxy::AccountSnapshot;
use crate::core::job::{Failure, JobId, JobInfo, Outcome};
use crate::host::Host;
use crate::log::registry::LoggerId;

/// Message sent from the worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// A request expecting one response.
    Request(Request),
    /// The attempt finished; no response follows.
    Done(Outcome),
}

/// Work the supervisor performs on behalf of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Acquire an account from the pool matching the host.
    AcquireAccountForHost(Host),
    /// Acquire a specific account, or any account from the default pool.
    AcquireAccount {
        /// Account to acquire.
        account: Option<AccountId>,
    },
    /// Release one account.
    ReleaseAccount(AccountId),
    /// Start a log record.
    LogAdd {
        /// Target logger.
        logger: LoggerId,
        /// Attempt the record belongs to.
        job: JobInfo,
    },
    /// Append text to the current record.
    Log {
        /// Target logger.
        logger: LoggerId,
        /// Job whose record receives the text.
        job: JobId,
        /// Text to append.
        message: String,
    },
    /// Finalize the current record as failed.
    LogAborted {
        /// Target logger.
        logger: LoggerId,
        /// Job whose record is finalized.
        job: JobId,
        /// Failure to record.
        failure: Failure,
    },
    /// Finalize the current record as succeeded.
    LogSucceeded {
        /// Target logger.
        logger: LoggerId,
        /// Job whose record is finalized.
        job: JobId,
    },
}

/// Supervisor answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The request succeeded without a value.
    Ok,
    /// An account was acquired.
    Account(AccountSnapshot),
    /// The request failed; the proxy turns this into an error.
    Error {
        /// Error class.
        kind: String,
        /// Rendered error.
        message: String,
    },
}

impl Response {
    /// An error response of class `kind`.
    pub fn error(kind: &str, err: &impl std::fmt::Display) -> Self {
        Self::Error {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_message_survives_json() {
        let msg = WorkerMessage::Done(Outcome::Fatal(Failure::new("panic", "boom")));
        let json = serde_json::to_string(&msg).unwrap();
        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
