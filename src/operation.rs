//! The operation capability guarded by the executor
//!
//! An [`Operation`] performs one remote call per `invoke`. The executor never
//! builds queries or parses payloads itself; it only sees the success value or
//! the [`RawFailure`] the operation reports.
//!
//! Any `FnMut() -> impl Future<Output = Result<T, RawFailure>>` closure is an
//! operation, so most callers never implement the trait by hand:
//!
//! ```rust,ignore
//! let op = || async { client.generate_text(&prompt).await.map_err(to_raw_failure) };
//! let summary = lexguard::run(op, &policy, &breaker).await?;
//! ```

use std::future::Future;

use crate::classify::RawFailure;

pub trait Operation: Send {
    type Output: Send;

    /// Perform one attempt of the remote call
    fn invoke(&mut self) -> impl Future<Output = Result<Self::Output, RawFailure>> + Send;
}

impl<F, Fut, T> Operation for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, RawFailure>> + Send,
    T: Send,
{
    type Output = T;

    fn invoke(&mut self) -> impl Future<Output = Result<T, RawFailure>> + Send {
        (self)()
    }
}
