//! Duplex request/response channel between a worker and its supervisor.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::core::error::ProxyError;
use crate::core::job::Outcome;
use crate::infra::protocol::{Request, Response, WorkerMessage};

struct Endpoint {
    tx: Sender<WorkerMessage>,
    rx: Receiver<Response>,
}

/// Worker side of the pipe. Clones share the channel; calls are serialized.
#[derive(Clone)]
pub struct WorkerPipe {
    endpoint: Arc<Mutex<Endpoint>>,
}

impl std::fmt::Debug for WorkerPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPipe").finish_non_exhaustive()
    }
}

/// Supervisor side of the pipe.
pub struct SupervisorEnd {
    rx: Receiver<WorkerMessage>,
    tx: Sender<Response>,
}

impl std::fmt::Debug for SupervisorEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorEnd").finish_non_exhaustive()
    }
}

/// Create a connected pair of endpoints.
#[must_use]
pub fn duplex() -> (WorkerPipe, SupervisorEnd) {
    let (up_tx, up_rx) = unbounded();
    let (down_tx, down_rx) = unbounded();
    (
        WorkerPipe {
            endpoint: Arc::new(Mutex::new(Endpoint {
                tx: up_tx,
                rx: down_rx,
            })),
        },
        SupervisorEnd {
            rx: up_rx,
            tx: down_tx,
        },
    )
}

impl WorkerPipe {
    /// Send `request` and block for its response.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Remote`] if the supervisor answered with an error.
    /// - [`ProxyError::Disconnected`] if the supervisor end is gone.
    pub fn call(&self, request: Request) -> Result<Response, ProxyError> {
        let endpoint = self.endpoint.lock();
        endpoint
            .tx
            .send(WorkerMessage::Request(request))
            .map_err(|_| ProxyError::Disconnected)?;
        match endpoint.rx.recv() {
            Ok(Response::Error { kind, message }) => Err(ProxyError::Remote { kind, message }),
            Ok(response) => Ok(response),
            Err(_) => Err(ProxyError::Disconnected),
        }
    }

    /// Send a request whose only valid answer is [`Response::Ok`].
    ///
    /// # Errors
    ///
    /// As [`WorkerPipe::call`], plus [`ProxyError::UnexpectedResponse`] for any other value.
    pub fn call_ok(&self, request: Request) -> Result<(), ProxyError> {
        match self.call(request)? {
            Response::Ok => Ok(()),
            other => Err(ProxyError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub(crate) fn finish(&self, outcome: Outcome) {
        // A supervisor that stopped listening has nothing left to learn.
        let _ = self.endpoint.lock().tx.send(WorkerMessage::Done(outcome));
    }
}

impl SupervisorEnd {
    /// Block for the next worker message. `None` once every worker endpoint is dropped.
    pub fn recv(&self) -> Option<WorkerMessage> {
        self.rx.recv().ok()
    }

    /// Answer the pending request. Returns `false` if the worker is gone.
    pub fn reply(&self, response: Response) -> bool {
        self.tx.send(response).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_error_response_becomes_remote_error() {
        let (worker, supervisor) = duplex();
        let server = thread::spawn(move || {
            while let Some(msg) = supervisor.recv() {
                match msg {
                    WorkerMessage::Request(Request::ReleaseAccount(_)) => {
                        supervisor.reply(Response::Error {
                            kind: "account".into(),
                            message: "not locked".into(),
                        });
                    }
                    WorkerMessage::Request(_) => {
                        supervisor.reply(Response::Ok);
                    }
                    WorkerMessage::Done(outcome) => return outcome,
                }
            }
            Outcome::Fatal(crate::core::job::Failure::new("disconnected", "gone"))
        });

        assert_eq!(
            worker.call(Request::ReleaseAccount(7)),
            Err(ProxyError::Remote {
                kind: "account".into(),
                message: "not locked".into()
            })
        );
        assert!(worker
            .call_ok(Request::AcquireAccount { account: None })
            .is_ok());
        worker.finish(Outcome::Succeeded);
        assert_eq!(server.join().unwrap(), Outcome::Succeeded);
    }

    #[test]
    fn test_dropped_supervisor_disconnects() {
        let (worker, supervisor) = duplex();
        drop(supervisor);
        assert_eq!(
            worker.call(Request::ReleaseAccount(1)),
            Err(ProxyError::Disconnected)
        );
    }

    #[test]
    fn test_dropped_worker_ends_recv() {
        let (worker, supervisor) = duplex();
        drop(worker);
        assert!(supervisor.recv().is_none());
    }
}
