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

//! A small structured-concurrency runtime.
//!
//! Five pieces, each in its own module, each sitting directly on top of
//! the one before it:
//!
//! - [`continuation`] - the one-shot suspend/resume primitive every
//!   suspension point in this crate is built from.
//! - [`context`] / [`dispatcher`] - the ambient `CoroutineContext` a
//!   coroutine runs with, and the `Dispatcher` that picks a thread to
//!   resume it on.
//! - [`job`] - `Job`/`Deferred<T>`, the structured job tree: cancellation
//!   cascades from parent to children, and a parent is never terminal
//!   before all of its children are.
//! - [`channel`] - a single-slot rendezvous `Channel<T>` built on the
//!   job tree's suspension primitive.
//! - [`generator`] - a demand-driven `Generator<T>`, pulled forward by
//!   its consumer rather than scheduled by a `Dispatcher`.
//!
//! [`scope::run_scope`] is the one blocking entry point a non-coroutine
//! caller needs; everything else in this crate only makes sense called
//! from inside a running coroutine.
//!
//! ```
//! use structured_coroutines::{run_scope, launch, yield_now, CoroutineContext};
//!
//! let result = run_scope(CoroutineContext::empty(), async {
//!     let child = launch(CoroutineContext::empty(), async {
//!         yield_now().await?;
//!         Ok(())
//!     });
//!     child.join().await?;
//!     Ok(42)
//! });
//! assert_eq!(result.unwrap(), 42);
//! ```

#[macro_use]
extern crate log;

pub mod channel;
pub mod context;
pub mod continuation;
pub mod coroutine;
pub mod dispatcher;
pub mod failure;
pub mod generator;
pub mod job;
pub mod scope;

#[cfg(test)]
mod tests;

pub use channel::Channel;
pub use context::{ContextElement, CoroutineContext};
pub use continuation::Continuation;
pub use dispatcher::{Dispatcher, InlineDispatcher, PoolDispatcher, SingleThreadDispatcher};
pub use failure::{Failure, Result};
pub use generator::{generate, Generator, Yielder};
pub use job::{defer, launch, Deferred, Job, JobState};
pub use scope::{delay, run_scope, yield_now};
