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

//! The entry point into this runtime (spec §4.F): `run_scope` blocks the
//! calling (ordinary, non-coroutine) thread until a root job finishes,
//! and `yield_now`/`delay` are the two general-purpose suspension points
//! every coroutine body gets for free, built on [`crate::job::suspend_parked`]
//! exactly like `Job::join` and `Channel`'s operations are.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

use crate::context::CoroutineContext;
use crate::continuation::Continuation;
use crate::coroutine;
use crate::dispatcher::{Dispatcher, InlineDispatcher};
use crate::failure::Failure;
use crate::job::{self, JobState};

/// Suspend the current coroutine and arrange, via the current
/// `Dispatcher`, to be resumed as if newly runnable - the cooperative
/// "let someone else go" primitive every coroutine body gets for free.
///
/// Unlike [`delay`], this never actually sleeps: the continuation is
/// resumed the moment the dispatcher gets around to running the
/// resubmitted task, which for [`InlineDispatcher`] is immediately, and
/// for a pool dispatcher is as soon as a worker is free.
pub async fn yield_now() -> Result<(), Failure> {
    job::suspend_parked(move |continuation: Continuation<()>| {
        match coroutine::current_dispatcher() {
            Some(dispatcher) => {
                let resume = continuation.clone();
                dispatcher.submit(Box::new(move || {
                    resume.try_resume(());
                }));
            }
            None => continuation.resume(()),
        }

        let cancel = continuation;
        Some(Box::new(move || {
            cancel.try_resume_with_failure(Failure::Cancellation);
        }) as Box<dyn FnOnce() + Send>)
    })
    .await
}

/// Suspend for at least `duration` (spec §4.F). Cancellation always wins
/// a race against the timer: requesting cancellation while parked here
/// resolves the continuation with `Failure::Cancellation` immediately,
/// rather than waiting for whichever of the two happens to reach the
/// continuation first.
pub async fn delay(duration: Duration) -> Result<(), Failure> {
    job::suspend_parked(move |continuation: Continuation<()>| {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let gate_for_timer = gate.clone();
        let continuation_for_timer = continuation.clone();

        thread::spawn(move || {
            let (lock, cvar) = &*gate_for_timer;
            let guard = lock.lock().unwrap();
            let (_guard, result) = cvar.wait_timeout_while(guard, duration, |cancelled| !*cancelled).unwrap();
            if result.timed_out() {
                continuation_for_timer.try_resume(());
            }
            // Otherwise we were woken early by the cancel hook below, which has
            // already resolved (or lost the race to resolve) the continuation.
        });

        let cancel_continuation = continuation;
        Some(Box::new(move || {
            {
                let (lock, cvar) = &*gate;
                *lock.lock().unwrap() = true;
                cvar.notify_one();
            }
            cancel_continuation.try_resume_with_failure(Failure::Cancellation);
        }) as Box<dyn FnOnce() + Send>)
    })
    .await
}

fn ensure_dispatcher(context: CoroutineContext) -> CoroutineContext {
    if context.get::<Arc<dyn Dispatcher>>().is_some() {
        context
    } else {
        context.with(Arc::new(InlineDispatcher) as Arc<dyn Dispatcher>)
    }
}

/// Run `block` as the body of a freshly-created root job and block the
/// calling thread until it finishes (spec §4.F).
///
/// `context` need not carry a `Dispatcher`; if it doesn't, an
/// [`InlineDispatcher`] is installed, so a scope with nothing else
/// configured never spawns a thread of its own.
///
/// If the root job ends up cancelled because an unobserved child failed
/// (spec §9's open question: `defer { throw }` with no matching
/// `await`), the original failure behind that cascade is re-raised here
/// rather than a bare `Cancellation` - callers of `run_scope` should
/// never see a cancellation whose actual cause was a bug elsewhere in
/// the scope.
pub fn run_scope<T, F>(context: CoroutineContext, block: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    let context = ensure_dispatcher(context);
    let deferred = job::Builder::new().name("scope-root").defer(context, block);

    match block_on(deferred.await_value()) {
        Ok(value) => Ok(value),
        Err(Failure::Cancellation) => match deferred.job().cancel_cause() {
            Some(cause) => Err(cause),
            None => Err(Failure::Cancellation),
        },
        Err(other) => Err(other),
    }
}

/// Returns the root job's own state without waiting; mostly useful from
/// tests that want to assert on `JobState::Cancelled` vs `Completed`
/// independent of the re-raised `Result`.
#[cfg(test)]
fn debug_root_state<T>(context: CoroutineContext, block: impl Future<Output = Result<T, Failure>> + Send + 'static) -> JobState
where
    T: Send + 'static,
{
    let context = ensure_dispatcher(context);
    let deferred = job::Builder::new().defer(context, block);
    let _ = block_on(deferred.await_value());
    deferred.job().state()
}

/// A minimal single-future blocking executor, used only to drive the
/// root job's `Deferred::await_value` from an ordinary (non-coroutine)
/// calling thread: parks the thread on `Pending` and relies on the
/// dispatcher-driven `Waker` installed by `coroutine.rs` to unpark it.
fn block_on<F: Future>(mut fut: F) -> F::Output {
    struct ThreadWaker(thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    // Safety: `fut` is a local that is never moved again before it is dropped.
    let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => thread::park(),
        }
    }
}
