// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The one failure taxonomy shared by every suspending operation in this
//! crate: cancellation, user failures and usage errors (see spec §7).

use std::fmt;
use std::sync::Arc;

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Failure>;

/// Everything a coroutine body, a `Job`, or a suspension point can fail
/// with.
///
/// `User` wraps the triggering error in an `Arc` rather than a `Box` so
/// that a `Failure` can be cheaply cloned when it needs to be both
/// reported to an `await`er and cascaded to a parent `Job` as a
/// cancellation cause (see `job.rs`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Failure {
    /// The expected outcome of a cancelled suspension point or job. Never
    /// propagates to a parent job the way a user failure does.
    #[error("operation was cancelled")]
    Cancellation,

    /// Anything a coroutine body returned as an error that isn't itself a
    /// cancellation.
    #[error("{0}")]
    User(Arc<dyn std::error::Error + Send + Sync>),

    /// A misuse of the runtime's contracts: double-resume of a
    /// `Continuation`, a second concurrent sender/receiver on a
    /// `Channel`, or similar. Usage errors are programming errors, not
    /// recoverable failures of the computation itself.
    #[error("usage error: {0}")]
    Usage(String),
}

impl Failure {
    /// Wrap an arbitrary error as a user failure.
    pub fn from_user_error<E>(error: E) -> Failure
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Failure::User(Arc::new(error))
    }

    /// Construct a usage error from a message.
    pub fn usage(message: impl Into<String>) -> Failure {
        Failure::Usage(message.into())
    }

    /// True for `Failure::Cancellation` only. A job whose body returns
    /// this failure completes as cancelled rather than failed, and does
    /// not request cancellation of its parent (spec §3, §7).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Failure::Cancellation)
    }
}

/// A lightweight string-only error, used in tests and small examples that
/// need a concrete `std::error::Error` to hand to
/// [`Failure::from_user_error`].
#[derive(Debug, Clone)]
pub struct Message(pub String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl Message {
    pub fn new(message: impl Into<String>) -> Message {
        Message(message.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancellation_is_recognized() {
        assert!(Failure::Cancellation.is_cancellation());
        assert!(!Failure::usage("bad").is_cancellation());
    }

    #[test]
    fn user_failure_displays_inner_message() {
        let failure = Failure::from_user_error(Message::new("boom"));
        assert_eq!(failure.to_string(), "boom");
    }

    #[test]
    fn user_failure_clones_cheaply() {
        let failure = Failure::from_user_error(Message::new("boom"));
        let cloned = failure.clone();
        assert_eq!(failure.to_string(), cloned.to_string());
    }
}
