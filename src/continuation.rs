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

//! `Continuation<T>`: a one-shot, value-consuming resume callback (spec
//! §4.A), and `suspend_here`, the single primitive every suspension point
//! in this crate (yield, delay, join, channel handoff) is built from
//! (spec §4.B "suspension protocol").
//!
//! Rust's own `async`/`await` already performs the compiler transform the
//! original design relies on a suspendable-block compiler for: every
//! `.await` is a suspension point, and the `Future` it awaits is exactly
//! a `Continuation`-shaped contract (store a waker, get woken later).
//! `suspend_here` is a thin adapter from that shape to the spec's
//! `Continuation`/`handler` vocabulary, so the rest of the crate (job
//! waiters, channel parking, timers) is written against one primitive
//! instead of hand-rolling a `Future` per suspension site.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Waker};

use crate::failure::Failure;

enum Outcome<T> {
    Value(T),
    Failure(Failure),
}

struct Shared<T> {
    outcome: Mutex<Option<Outcome<T>>>,
    waker: Mutex<Option<Waker>>,
    resumed: AtomicBool,
}

/// A one-shot resume callback. Exactly one of [`resume`](Continuation::resume)
/// or [`resume_with_failure`](Continuation::resume_with_failure) may be
/// called, exactly once; a second call is a usage error and panics, per
/// spec §3 ("double-resume is a programming error and must be
/// detectable").
///
/// A `Continuation` may be resumed from any thread (spec §4.A); cloning
/// it hands out another handle to the same one-shot slot, it does not
/// create a second resumable instance.
pub struct Continuation<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Continuation {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("resumed", &self.shared.resumed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Continuation<T> {
    fn complete(&self, outcome: Outcome<T>) {
        if self.shared.resumed.swap(true, Ordering::AcqRel) {
            panic!("Continuation resumed more than once");
        }
        *self.shared.outcome.lock().unwrap() = Some(outcome);
        if let Some(waker) = self.shared.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Resume with a successful value.
    pub fn resume(&self, value: T) {
        self.complete(Outcome::Value(value));
    }

    /// Resume with a failure (spec §4.A: "resumeWithFailure").
    pub fn resume_with_failure(&self, failure: Failure) {
        self.complete(Outcome::Failure(failure));
    }

    /// Whether this continuation has already been resumed. Racy by
    /// nature (another thread may resume it the instant after this
    /// returns `false`); intended for diagnostics, not synchronization.
    pub fn is_resumed(&self) -> bool {
        self.shared.resumed.load(Ordering::Acquire)
    }

    fn try_complete(&self, outcome: Outcome<T>) -> bool {
        if self.shared.resumed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.shared.outcome.lock().unwrap() = Some(outcome);
        if let Some(waker) = self.shared.waker.lock().unwrap().take() {
            waker.wake();
        }
        true
    }

    /// Like [`resume`](Continuation::resume), but returns `false` instead
    /// of panicking if the continuation was already resumed.
    ///
    /// Used internally wherever two independent events can race to
    /// resolve the same suspension point - a job being cancelled while a
    /// timer it's waiting on also happens to fire, for instance (see
    /// `job.rs`, `scope.rs`). In those cases losing the race is the
    /// expected outcome for one side, not a usage error, so the panicking
    /// `resume`/`resume_with_failure` would be the wrong tool.
    pub(crate) fn try_resume(&self, value: T) -> bool {
        self.try_complete(Outcome::Value(value))
    }

    /// The failure-carrying counterpart of [`try_resume`](Continuation::try_resume).
    pub(crate) fn try_resume_with_failure(&self, failure: Failure) -> bool {
        self.try_complete(Outcome::Failure(failure))
    }

    /// Whether `self` and `other` refer to the same one-shot slot, as
    /// opposed to two continuations that merely carry equal values.
    /// `channel.rs` uses this to tell, under its own state lock, whether
    /// the registration a cancel hook is about to tear down is still the
    /// one it was handed (versus one a concurrent handoff already
    /// replaced).
    pub(crate) fn ptr_eq(&self, other: &Continuation<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// The `Future` returned by [`suspend_here`].
///
/// On first poll it stores the waker and invokes `handler` exactly once
/// with a fresh `Continuation`. If `handler` resumes the continuation
/// synchronously (the spec's "returns a value `v` synchronously" path),
/// the slot is already populated by the time the poll checks it, so this
/// future resolves on that same poll without ever returning `Pending` —
/// the two paths described in spec §4.B are handled uniformly by this
/// one poll implementation.
pub struct SuspendHere<T, H> {
    handler: Option<H>,
    shared: Arc<Shared<T>>,
}

impl<T, H> Future for SuspendHere<T, H>
where
    H: FnOnce(Continuation<T>),
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        // Safety: we never move out of `self` except for the `Option::take`s below,
        // which is a normal field projection on an unpinned `Option`.
        let this = unsafe { self.get_unchecked_mut() };

        *this.shared.waker.lock().unwrap() = Some(cx.waker().clone());

        if let Some(handler) = this.handler.take() {
            let continuation = Continuation {
                shared: this.shared.clone(),
            };
            handler(continuation);
        }

        match this.shared.outcome.lock().unwrap().take() {
            Some(Outcome::Value(value)) => Poll::Ready(Ok(value)),
            Some(Outcome::Failure(failure)) => Poll::Ready(Err(failure)),
            None => Poll::Pending,
        }
    }
}

/// The primitive suspension point (spec §4.B): hand the current
/// continuation to `handler`. If `handler` arranges for the
/// continuation to be resumed later (from a timer, a channel peer, a
/// child job's completion...) and returns without resuming it, the
/// `.await`ing coroutine suspends. If `handler` resumes the continuation
/// before returning, the `.await` completes immediately with that value.
pub fn suspend_here<T, H>(handler: H) -> SuspendHere<T, H>
where
    H: FnOnce(Continuation<T>),
{
    SuspendHere {
        handler: Some(handler),
        shared: Arc::new(Shared {
            outcome: Mutex::new(None),
            waker: Mutex::new(None),
            resumed: AtomicBool::new(false),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[should_panic(expected = "resumed more than once")]
    fn double_resume_panics() {
        let shared = Arc::new(Shared {
            outcome: Mutex::<Option<Outcome<i32>>>::new(None),
            waker: Mutex::new(None),
            resumed: AtomicBool::new(false),
        });
        let continuation = Continuation { shared };
        continuation.resume(1);
        continuation.resume(2);
    }

    #[test]
    fn synchronous_resume_resolves_without_pending() {
        let fut = suspend_here(|k: Continuation<i32>| k.resume(42));
        futures_lite_block_on(fut).unwrap();
    }

    // A tiny hand-rolled executor for this unit test only; `scope.rs`'s
    // integration tests exercise the real dispatcher-driven path.
    fn futures_lite_block_on<F: Future>(mut fut: F) -> F::Output {
        use std::task::{RawWaker, RawWakerVTable};

        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

        let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
        let mut cx = TaskContext::from_waker(&waker);
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            if let Poll::Ready(value) = fut.as_mut().poll(&mut cx) {
                return value;
            }
        }
    }
}
