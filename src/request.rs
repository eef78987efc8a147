//! Request handles for nonblocking operations.

use crate::error::{Error, ErrorMode, Result};
use crate::process::{Posted, ProcessState};
use crate::status::Status;
use crate::transport::Envelope;
use std::rc::Rc;

type Finish<'a> = Box<dyn FnOnce(Envelope) -> Status + 'a>;

enum Pending<'a> {
    Done(Status),
    Recv { posted: Rc<Posted>, finish: Finish<'a> },
    Consumed,
}

/// A handle to a nonblocking operation.
///
/// A receive request borrows its buffer for `'a`; the buffer can be read
/// again once the request has been waited on (or dropped, which waits).
///
/// # Example
///
/// ```
/// use mpirt::{Config, Universe};
///
/// Universe::new(Config::default())
///     .run(2, |mpi| {
///         let world = mpi.world();
///         let peer = 1 - world.rank();
///         let mut incoming = [0i64; 4];
///         let request = world.irecv(&mut incoming, peer, 0)?;
///         world.send(&[world.rank() as i64; 4], peer, 0)?;
///         let status = request.wait()?;
///         assert_eq!(status.source, peer);
///         assert_eq!(incoming, [peer as i64; 4]);
///         Ok(())
///     })
///     .unwrap();
/// ```
pub struct Request<'a> {
    state: Rc<ProcessState>,
    errors: ErrorMode,
    pending: Pending<'a>,
}

impl<'a> Request<'a> {
    pub(crate) fn completed(state: &Rc<ProcessState>, errors: ErrorMode, status: Status) -> Self {
        Request {
            state: Rc::clone(state),
            errors,
            pending: Pending::Done(status),
        }
    }

    pub(crate) fn receive(
        state: &Rc<ProcessState>,
        errors: ErrorMode,
        posted: Rc<Posted>,
        finish: Finish<'a>,
    ) -> Self {
        Request {
            state: Rc::clone(state),
            errors,
            pending: Pending::Recv { posted, finish },
        }
    }

    /// Check if this request has been completed.
    pub fn is_completed(&self) -> bool {
        match &self.pending {
            Pending::Done(_) | Pending::Consumed => true,
            Pending::Recv { posted, .. } => posted.is_complete(),
        }
    }

    /// Move a matched receive into the `Done` state.
    fn settle(&mut self) -> Result<()> {
        match &self.pending {
            Pending::Recv { posted, .. } if posted.is_complete() => {}
            _ => return Ok(()),
        }
        if let Pending::Recv { posted, finish } =
            std::mem::replace(&mut self.pending, Pending::Consumed)
        {
            let envelope = posted
                .take()
                .ok_or_else(|| Error::Internal("receive matched without a message".into()))?;
            self.pending = Pending::Done(finish(envelope));
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<Status> {
        if let Pending::Recv { posted, .. } = &self.pending {
            let posted = Rc::clone(posted);
            self.state.progress_until(|_| posted.is_complete())?;
        }
        self.settle()?;
        match std::mem::replace(&mut self.pending, Pending::Consumed) {
            Pending::Done(status) => Ok(status),
            _ => Err(Error::InvalidRequest),
        }
    }

    /// Wait for this operation to complete.
    ///
    /// Blocks until the operation is finished, then returns its status.
    pub fn wait(mut self) -> Result<Status> {
        let result = self.complete();
        self.state.route(self.errors, result)
    }

    /// Test if this operation has completed without blocking.
    ///
    /// Returns `true` once the operation is complete; [`wait`](Self::wait)
    /// then returns its status at once.
    pub fn test(&mut self) -> Result<bool> {
        let result = self.state.poll().and_then(|()| self.settle());
        self.state.route(self.errors, result)?;
        Ok(self.is_completed())
    }

    /// Wait for all requests in a collection to complete, returning their
    /// statuses in order.
    pub fn wait_all(requests: Vec<Request<'a>>) -> Result<Vec<Status>> {
        requests.into_iter().map(Request::wait).collect()
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = match &self.pending {
            Pending::Done(_) => "done",
            Pending::Recv { .. } => "receive",
            Pending::Consumed => "consumed",
        };
        f.debug_struct("Request")
            .field("process", &self.state.pid)
            .field("pending", &pending)
            .finish()
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if let Pending::Recv { .. } = self.pending {
            // A receive left in flight would write into a buffer that is no
            // longer borrowed, so finish it here.
            if let Err(err) = self.complete() {
                tracing::debug!(error = %err, "dropped request did not complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, Error, ErrorMode, Universe, PROC_NULL};

    #[test]
    fn test_polls_until_complete() {
        Universe::new(Config::default().with_errors(ErrorMode::Return))
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    let mut buf = [0u32; 3];
                    let mut request = world.irecv(&mut buf, 1, 2)?;
                    world.barrier()?;
                    while !request.test()? {
                        std::thread::yield_now();
                    }
                    let status = request.wait()?;
                    assert_eq!(status.count, 3);
                    assert_eq!(buf, [7, 8, 9]);
                } else {
                    world.barrier()?;
                    world.send(&[7u32, 8, 9], 0, 2)?;
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn wait_all_preserves_order() {
        Universe::new(Config::default().with_errors(ErrorMode::Return))
            .run(3, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    let mut a = [0i32];
                    let mut b = [0i32];
                    let requests = vec![world.irecv(&mut a, 2, 0)?, world.irecv(&mut b, 1, 0)?];
                    let statuses = super::Request::wait_all(requests)?;
                    assert_eq!(statuses[0].source, 2);
                    assert_eq!(statuses[1].source, 1);
                    assert_eq!((a[0], b[0]), (20, 10));
                } else {
                    world.send(&[world.rank() * 10], 0, 0)?;
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn completed_requests() {
        Universe::new(Config::default().with_errors(ErrorMode::Return))
            .run(1, |mpi| {
                let world = mpi.world();
                let mut buf = [1.0f64];
                let request = world.irecv(&mut buf, PROC_NULL, 0)?;
                assert!(request.is_completed());
                assert_eq!(request.wait()?.source, PROC_NULL);
                let sent = world.isend(&[1.0f64, 2.0], PROC_NULL, 0)?;
                assert!(sent.is_completed());
                sent.wait()?;
                assert!(matches!(
                    world.isend(&[1u8], 3, 0),
                    Err(Error::InvalidRank(3))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn eager_send_waits_to_its_status() {
        Universe::new(Config::default())
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    let request = world.isend(&[5i64, 6], 1, 4)?;
                    assert!(request.is_completed());
                    request.wait()?;
                } else {
                    let mut buf = [0i64; 2];
                    world.recv(&mut buf, 0, 4)?;
                    assert_eq!(buf, [5, 6]);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn wait_after_successful_test() {
        Universe::new(Config::default())
            .run(2, |mpi| {
                let world = mpi.world();
                if world.rank() == 0 {
                    let mut buf = [0u8; 2];
                    let mut request = world.irecv(&mut buf, 1, 0)?;
                    while !request.test()? {
                        std::thread::yield_now();
                    }
                    assert!(request.test()?);
                    let status = request.wait()?;
                    assert_eq!((status.source, status.count), (1, 2));
                    assert_eq!(buf, [3, 4]);

                    let mut idle = world.isend(&[0u8], PROC_NULL, 0)?;
                    assert!(idle.test()?);
                    assert_eq!(idle.wait()?.source, PROC_NULL);
                } else {
                    world.send(&[3u8, 4], 0, 0)?;
                }
                Ok(())
            })
            .unwrap();
    }
}
