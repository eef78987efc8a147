//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive and probe
//! operations, containing metadata about a delivered (or pending) message.

use crate::error::Error;

/// Information about a probed or received message.
///
/// A receive into a buffer smaller than the incoming message still completes:
/// `count` is the number of elements actually delivered and `expected` the
/// number the sender sent. [`Status::truncation`] turns that into the
/// corresponding [`Error::Truncated`] for callers that want to treat it as one.
///
/// # Example
///
/// ```
/// use mpirt::{Config, Universe, ANY_SOURCE, ANY_TAG};
///
/// Universe::new(Config::default())
///     .run(2, |mpi| {
///         let world = mpi.world();
///         if world.rank() == 0 {
///             world.send(&[1.0f64, 2.0, 3.0], 1, 7)?;
///         } else {
///             let status = world.probe::<f64>(ANY_SOURCE, ANY_TAG)?;
///             assert_eq!((status.source, status.tag, status.count), (0, 7, 3));
///             let mut buf = vec![0.0; status.count as usize];
///             world.recv(&mut buf, status.source, status.tag)?;
///         }
///         Ok(())
///     })
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements delivered (or available, for a probe).
    pub count: i64,
    /// Number of elements the sender sent.
    pub expected: i64,
}

impl Status {
    pub(crate) fn new(source: i32, tag: i32, count: i64, expected: i64) -> Self {
        Status {
            source,
            tag,
            count,
            expected,
        }
    }

    /// Status of a receive from `PROC_NULL`: no data, completes immediately.
    pub(crate) fn empty(source: i32) -> Self {
        Status::new(source, crate::ANY_TAG, 0, 0)
    }

    /// Whether the receive buffer was too small for the message.
    pub fn is_truncated(&self) -> bool {
        self.expected > self.count
    }

    /// The truncation error for this status, if the message was truncated.
    pub fn truncation(&self) -> Option<Error> {
        self.is_truncated().then(|| Error::Truncated {
            received: self.count,
            expected: self.expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_status_has_no_truncation() {
        let status = Status::new(1, 5, 10, 10);
        assert!(!status.is_truncated());
        assert!(status.truncation().is_none());
    }

    #[test]
    fn truncated_status_reports_both_sizes() {
        let status = Status::new(0, 0, 4, 9);
        assert!(status.is_truncated());
        assert_eq!(
            status.truncation(),
            Some(Error::Truncated {
                received: 4,
                expected: 9
            })
        );
    }
}
