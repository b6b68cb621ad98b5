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

//! The coroutine builder (spec §4.B): turns a suspendable block (here, an
//! ordinary Rust `Future`, since `async`/`.await` already is the
//! suspend-point state machine the original design needed a compiler for)
//! plus an outer completion callback into something a `Dispatcher` can
//! run to completion-or-suspension.
//!
//! This plays the role the teacher's `builder.rs` + `environment.rs` play
//! together: `Builder`/`Options` configure a coroutine-to-be the same way
//! (minus the stack-size knob, which has no meaning once the runtime no
//! longer owns a raw stack per coroutine — see `DESIGN.md`), and the
//! thread-local `CURRENT_CONTEXT` below is this crate's equivalent of the
//! teacher's thread-local `Environment`: both exist so code running
//! *inside* a coroutine can ask "what am I, and who resumes me".

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Wake, Waker};

use crate::context::CoroutineContext;
use crate::dispatcher::{Dispatcher, Task};
use crate::failure::Failure;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<CoroutineContext>> = RefCell::new(None);
}

/// The `CoroutineContext` active on the calling thread, if it is
/// currently inside a coroutine poll. `scope.rs`'s suspension helpers use
/// this to find the current `Dispatcher`.
pub fn current_context() -> Option<CoroutineContext> {
    CURRENT_CONTEXT.with(|cell| cell.borrow().clone())
}

/// The `Dispatcher` installed in the current context, if any poll is in
/// progress and that context carries one.
pub fn current_dispatcher() -> Option<Arc<dyn Dispatcher>> {
    current_context().and_then(|ctx| ctx.get::<Arc<dyn Dispatcher>>().map(|d| (*d).clone()))
}

fn set_current_context(context: Option<CoroutineContext>) {
    CURRENT_CONTEXT.with(|cell| *cell.borrow_mut() = context);
}

/// Coroutine spawn options. Mirrors the teacher's `Options`: a name used
/// only for diagnostics (panic messages, log lines, thread names for
/// pool-dispatched work), nothing else is configurable at this layer.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub name: Option<String>,
}

/// Chainable configuration for spawning a coroutine, mirroring
/// `rustcc-coroutine-rs::Builder`.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    opts: Options,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.opts.name = Some(name.into());
        self
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }
}

/// The coroutine builder itself (spec §4.B): given a context (which must
/// carry the `Dispatcher` the entry continuation is submitted through),
/// a future body, and an `on_complete` callback standing in for the
/// "outer continuation", schedule the body's first poll.
///
/// Every subsequent suspension/resume cycle is driven by the `Waker`
/// installed here: waking resubmits a "poll this coroutine once more"
/// task through the *same* dispatcher, so a continuation captured deep
/// inside a suspension point still resumes on a thread the dispatcher
/// chose, exactly as spec §4.A requires.
pub fn spawn<T, F, C>(context: CoroutineContext, builder: Builder, body: F, on_complete: C)
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
    C: FnOnce(Result<T, Failure>) + Send + 'static,
{
    let dispatcher = context
        .get::<Arc<dyn Dispatcher>>()
        .map(|d| (*d).clone())
        .expect("CoroutineContext passed to coroutine::spawn must carry a Dispatcher");

    let task = Arc::new(CoroutineTask {
        name: builder.opts.name,
        context,
        dispatcher,
        future: Mutex::new(Some(Box::pin(body))),
        on_complete: Mutex::new(Some(Box::new(on_complete))),
        polling: AtomicBool::new(false),
        wake_pending: AtomicBool::new(false),
    });

    CoroutineTask::schedule(task);
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = Result<T, Failure>> + Send>>;
type OnComplete<T> = Box<dyn FnOnce(Result<T, Failure>) + Send>;

struct CoroutineTask<T> {
    name: Option<String>,
    context: CoroutineContext,
    dispatcher: Arc<dyn Dispatcher>,
    future: Mutex<Option<BoxedFuture<T>>>,
    on_complete: Mutex<Option<OnComplete<T>>>,
    // `poll_once` below is reentrancy-guarded rather than recursive: an
    // `InlineDispatcher` resumes a continuation *inside* the very `poll`
    // call that parked it, so `wake` can fire on this same thread before
    // that `poll` has returned. Recursing straight back into `poll_once`
    // there would try to lock `future` a second time on the same thread
    // and deadlock. Instead a wake arriving mid-poll just flips
    // `wake_pending` and returns; the in-progress poll loops instead of
    // recursing once it sees the flag.
    polling: AtomicBool,
    wake_pending: AtomicBool,
}

impl<T: Send + 'static> CoroutineTask<T> {
    /// Submit a "poll me once" task through this coroutine's dispatcher.
    fn schedule(self: Arc<Self>) {
        let dispatcher = self.dispatcher.clone();
        let task: Task = Box::new(move || self.poll_once());
        dispatcher.submit(task);
    }

    fn poll_once(self: Arc<Self>) {
        if self.polling.swap(true, Ordering::AcqRel) {
            self.wake_pending.store(true, Ordering::Release);
            return;
        }

        loop {
            self.wake_pending.store(false, Ordering::Release);

            let mut future_slot = self.future.lock().unwrap();
            let future = match future_slot.as_mut() {
                Some(future) => future,
                // Already completed; a stray wake raced the final poll. Spec
                // §4.A only promises exactly-once resume of the *outer*
                // continuation, which already happened, so this is a silent
                // no-op.
                None => {
                    self.polling.store(false, Ordering::Release);
                    return;
                }
            };

            set_current_context(Some(self.context.clone()));
            let waker = Waker::from(self.clone());
            let mut task_cx = TaskContext::from_waker(&waker);
            let poll = future.as_mut().poll(&mut task_cx);
            set_current_context(None);

            match poll {
                Poll::Pending => {
                    drop(future_slot);
                    if !self.wake_pending.load(Ordering::Acquire) {
                        self.polling.store(false, Ordering::Release);
                        return;
                    }
                    // A wake landed while we were polling: loop and poll
                    // again instead of recursing.
                }
                Poll::Ready(result) => {
                    *future_slot = None;
                    drop(future_slot);
                    self.polling.store(false, Ordering::Release);
                    if let Some(on_complete) = self.on_complete.lock().unwrap().take() {
                        on_complete(result);
                    } else {
                        log::warn!(
                            "coroutine {:?} completed twice; dropping duplicate result",
                            self.name
                        );
                    }
                    return;
                }
            }
        }
    }
}

impl<T: Send + 'static> Wake for CoroutineTask<T> {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().schedule();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::InlineDispatcher;
    use std::sync::mpsc;

    #[test]
    fn spawn_runs_immediate_future_to_completion() {
        let context = CoroutineContext::empty().with(Arc::new(InlineDispatcher) as Arc<dyn Dispatcher>);
        let (tx, rx) = mpsc::channel();
        spawn(
            context,
            Builder::new().name("test"),
            async { Ok::<_, Failure>(7) },
            move |result| tx.send(result).unwrap(),
        );
        assert_eq!(rx.recv().unwrap().unwrap(), 7);
    }

    #[test]
    fn current_context_is_set_only_while_polling() {
        assert!(current_context().is_none());

        let context = CoroutineContext::empty().with(Arc::new(InlineDispatcher) as Arc<dyn Dispatcher>);
        let (tx, rx) = mpsc::channel();
        spawn(
            context,
            Builder::new(),
            async { Ok::<_, Failure>(current_context().is_some()) },
            move |result| tx.send(result).unwrap(),
        );
        assert!(rx.recv().unwrap().unwrap());
        assert!(current_context().is_none());
    }
}
