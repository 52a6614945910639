//! Pre/post signal wrapping for engine callbacks.
//!
//! Every [`DataOps`](super::DataOps) call is surrounded by a pre signal and
//! a post signal. A failing pre slot skips the real operation; post slots
//! always fire and receive how the operation ended plus its final status.
//! When several slots fail, the first status code wins and the others are
//! only logged.

use sync_api::SyncStatus;
use tracing::warn;

/// How a wrapped operation ended, as seen by post signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTag {
    /// A pre signal failed; the real operation never ran.
    Skipped,
    /// The operation ran to completion (successfully or not).
    Finished,
    /// The operation failed with an error status.
    Exception,
    /// No implementation is installed for this operation.
    NotImplemented,
}

type PreSlot<A> = Box<dyn FnMut(&A) -> Result<(), SyncStatus> + Send + Sync>;
type PostSlot<A> = Box<dyn FnMut(&A, ExecutionTag, SyncStatus) -> Result<(), SyncStatus> + Send + Sync>;

/// Signal slots around one operation with argument tuple `A`.
pub struct Operation<A> {
    pre: Vec<PreSlot<A>>,
    post: Vec<PostSlot<A>>,
}

impl<A> Default for Operation<A> {
    fn default() -> Self {
        Operation {
            pre: Vec::new(),
            post: Vec::new(),
        }
    }
}

impl<A> Operation<A> {
    pub fn add_pre(
        &mut self,
        slot: impl FnMut(&A) -> Result<(), SyncStatus> + Send + Sync + 'static,
    ) {
        self.pre.push(Box::new(slot));
    }

    pub fn add_post(
        &mut self,
        slot: impl FnMut(&A, ExecutionTag, SyncStatus) -> Result<(), SyncStatus> + Send + Sync + 'static,
    ) {
        self.post.push(Box::new(slot));
    }

    /// Run `op` between the signals. The returned status is the first
    /// failure seen in pre slots, the operation, or post slots.
    pub fn invoke<T>(
        &mut self,
        args: &A,
        op: impl FnOnce() -> Result<T, SyncStatus>,
    ) -> Result<T, SyncStatus> {
        use ExecutionTag::*;

        let mut first_error: Option<SyncStatus> = None;

        for slot in &mut self.pre {
            if let Err(status) = slot(args) {
                if first_error.is_none() {
                    first_error = Some(status);
                } else {
                    warn!(%status, "further pre-signal failure ignored");
                }
            }
        }

        let (tag, mut result) = match first_error {
            Some(status) => (Skipped, Err(status)),
            None => match op() {
                Ok(v) => (Finished, Ok(v)),
                Err(status) if status == SyncStatus::NOT_IMPLEMENTED => {
                    (NotImplemented, Err(status))
                }
                Err(status) => (Exception, Err(status)),
            },
        };

        let status_so_far = match &result {
            Ok(_) => SyncStatus::OK,
            Err(s) => *s,
        };
        for slot in &mut self.post {
            if let Err(status) = slot(args, tag, status_so_far) {
                if result.is_ok() {
                    result = Err(status);
                } else {
                    warn!(%status, "further post-signal failure ignored");
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn pre_failure_skips_operation() {
        let mut op: Operation<()> = Operation::default();
        op.add_pre(|_| Err(SyncStatus::FATAL));
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        op.add_post(move |_, tag, status| {
            assert_eq!(tag, ExecutionTag::Skipped);
            assert_eq!(status, SyncStatus::FATAL);
            seen2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let ran = std::cell::Cell::new(false);
        let result: Result<(), _> = op.invoke(&(), || {
            ran.set(true);
            Ok(())
        });
        assert_eq!(result.unwrap_err(), SyncStatus::FATAL);
        assert!(!ran.get());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_always_fires_and_first_code_wins() {
        let mut op: Operation<()> = Operation::default();
        op.add_post(|_, tag, _| {
            assert_eq!(tag, ExecutionTag::Finished);
            Err(SyncStatus::DATASTORE_FAILURE)
        });
        op.add_post(|_, _, _| Err(SyncStatus::FATAL));

        let result = op.invoke(&(), || Ok(42));
        // the operation succeeded, so the first post failure is the result
        assert_eq!(result.unwrap_err(), SyncStatus::DATASTORE_FAILURE);
    }

    #[test]
    fn operation_error_outranks_post_error() {
        let mut op: Operation<()> = Operation::default();
        op.add_post(|_, tag, status| {
            assert_eq!(tag, ExecutionTag::Exception);
            assert_eq!(status, SyncStatus::NOT_FOUND);
            Err(SyncStatus::FATAL)
        });
        let result: Result<(), _> = op.invoke(&(), || Err(SyncStatus::NOT_FOUND));
        assert_eq!(result.unwrap_err(), SyncStatus::NOT_FOUND);
    }

    #[test]
    fn not_implemented_is_tagged() {
        let mut op: Operation<()> = Operation::default();
        op.add_post(|_, tag, _| {
            assert_eq!(tag, ExecutionTag::NotImplemented);
            Ok(())
        });
        let result: Result<(), _> = op.invoke(&(), || Err(SyncStatus::NOT_IMPLEMENTED));
        assert_eq!(result.unwrap_err(), SyncStatus::NOT_IMPLEMENTED);
    }
}
