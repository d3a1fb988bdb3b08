//! Supervisor-side request handling.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::account::{AccountManager, AccountSnapshot, OwnerToken};
use crate::core::error::{AccountError, LogError};
use crate::core::job::{Failure, Outcome};
use crate::infra::pipe::SupervisorEnd;
use crate::infra::protocol::{Request, Response, WorkerMessage};
use crate::log::registry::{LoggerId, LoggerRegistry};
use crate::log::JobLogger;

/// Objects a supervisor serves to its job: the account manager and the logger registry.
#[derive(Debug, Clone, Default)]
pub struct Services {
    accounts: Arc<AccountManager>,
    loggers: Arc<LoggerRegistry>,
}

impl Services {
    /// Bundle an account manager and a logger registry.
    pub const fn new(accounts: Arc<AccountManager>, loggers: Arc<LoggerRegistry>) -> Self {
        Self { accounts, loggers }
    }

    /// The account manager.
    pub const fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    /// The logger registry.
    pub const fn loggers(&self) -> &Arc<LoggerRegistry> {
        &self.loggers
    }

    fn with_logger(
        &self,
        id: LoggerId,
        f: impl FnOnce(&dyn JobLogger) -> Result<(), LogError>,
    ) -> Response {
        let Some(logger) = self.loggers.get(id) else {
            return Response::error("log", &LogError::UnknownLogger(id.to_string()));
        };
        match f(logger.as_ref()) {
            Ok(()) => Response::Ok,
            Err(err) => Response::error("log", &err),
        }
    }

    /// Perform `request` on behalf of the job identified by `owner`.
    pub fn handle(&self, owner: &OwnerToken, request: Request) -> Response {
        trace!(owner = %owner, request = ?request, "serving worker request");
        match request {
            Request::AcquireAccountForHost(host) => {
                match self.accounts.acquire_account_for(&host, owner) {
                    Ok(account) => Response::Account(AccountSnapshot::from(account.as_ref())),
                    Err(err) => Response::error("account", &err),
                }
            }
            Request::AcquireAccount { account: None } => {
                match self.accounts.acquire_account(None, owner) {
                    Ok(account) => Response::Account(AccountSnapshot::from(account.as_ref())),
                    Err(err) => Response::error("account", &err),
                }
            }
            Request::AcquireAccount { account: Some(id) } => {
                let Some(account) = self.accounts.get_account(id) else {
                    return Response::error(
                        "account",
                        &AccountError::UnknownAccount(id.to_string()),
                    );
                };
                match self.accounts.acquire_account(Some(&account), owner) {
                    Ok(account) => Response::Account(AccountSnapshot::from(account.as_ref())),
                    Err(err) => Response::error("account", &err),
                }
            }
            Request::ReleaseAccount(id) => match self.accounts.release_account(id, owner) {
                Ok(()) => Response::Ok,
                Err(err) => Response::error("account", &err),
            },
            Request::LogAdd { logger, job } => self.with_logger(logger, |l| l.add_log(&job)),
            Request::Log {
                logger,
                job,
                message,
            } => self.with_logger(logger, |l| l.log(job, &message)),
            Request::LogAborted {
                logger,
                job,
                failure,
            } => self.with_logger(logger, |l| l.log_aborted(job, &failure)),
            Request::LogSucceeded { logger, job } => {
                self.with_logger(logger, |l| l.log_succeeded(job))
            }
        }
    }

    /// Answer requests until the worker reports its outcome.
    ///
    /// A worker that goes away without reporting yields a fatal `disconnected` outcome.
    pub fn serve(&self, owner: &OwnerToken, end: &SupervisorEnd) -> Outcome {
        while let Some(message) = end.recv() {
            match message {
                WorkerMessage::Request(request) => {
                    let response = self.handle(owner, request);
                    if !end.reply(response) {
                        debug!(owner = %owner, "worker left before reading its response");
                    }
                }
                WorkerMessage::Done(outcome) => return outcome,
            }
        }
        Outcome::Fatal(Failure::new(
            "disconnected",
            "worker exited without reporting an outcome",
        ))
    }

    /// Release whatever `owner` still holds.
    pub fn release_accounts(&self, owner: &OwnerToken) {
        self.accounts.release_accounts(owner);
    }
}
