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

//! `Job` and `Deferred<T>` (spec §4.C): the structured job tree. A `Job`
//! is a lifecycle handle - state, children, completion waiters; a
//! `Deferred<T>` is a `Job` that additionally carries a typed result
//! slot.
//!
//! This is the load-bearing module of the crate (the spec gives it 30%
//! of the budget). The state machine below follows spec §4.C's diagram
//! exactly, with one addition the diagram leaves implicit but the
//! invariant list right above it states outright: a job's terminal
//! transition always first requests cancellation of every still-active
//! child, then waits for all of them - `finalize_children` below is that
//! step, factored out because both an explicit `cancel()` and a normal
//! return need it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::context::CoroutineContext;
use crate::continuation::{suspend_here, Continuation};
use crate::coroutine;
use crate::dispatcher::Dispatcher;
use crate::failure::Failure;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A snapshot of a [`Job`]'s lifecycle state (spec §3: `{ Active,
/// Cancelling, Completed(result|failure), Cancelled }`). `Completed` is
/// split into `Completed`/`Failed` here so a caller that only wants to
/// know "did it work" doesn't need to match on a nested `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Active,
    Cancelling,
    Completed,
    Failed(Failure),
    Cancelled,
}

#[derive(Debug, Clone)]
enum Outcome {
    Success,
    Failed(Failure),
    Cancelled(Option<Failure>),
}

impl Outcome {
    fn to_job_state(&self) -> JobState {
        match self {
            Outcome::Success => JobState::Completed,
            Outcome::Failed(f) => JobState::Failed(f.clone()),
            Outcome::Cancelled(_) => JobState::Cancelled,
        }
    }
}

enum RawState {
    Active,
    Cancelling,
    Terminal(Outcome),
}

type ParkedHook = Box<dyn FnOnce() + Send>;
type Waiter = Box<dyn FnOnce() + Send>;

struct JobInner {
    id: u64,
    name: Option<String>,
    state: Mutex<RawState>,
    parent: Option<Job>,
    children: Mutex<Vec<Weak<JobInner>>>,
    waiters: Mutex<Vec<Waiter>>,
    cancel_cause: Mutex<Option<Failure>>,
    parked: Mutex<Option<ParkedHook>>,
}

/// A lifecycle handle for a running coroutine (spec §4.C). Cloning a
/// `Job` hands out another reference to the same underlying job, not a
/// copy of it - exactly like the teacher's `Handle`.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Job {}

impl Job {
    /// The `Job` installed as "current" in the ambient coroutine
    /// context, if any (there is none outside of a running coroutine).
    pub fn current() -> Option<Job> {
        coroutine::current_context()?.get::<Job>().map(|j| (*j).clone())
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// A non-blocking snapshot of this job's lifecycle state.
    pub fn state(&self) -> JobState {
        match &*self.inner.state.lock().unwrap() {
            RawState::Active => JobState::Active,
            RawState::Cancelling => JobState::Cancelling,
            RawState::Terminal(outcome) => outcome.to_job_state(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), JobState::Active)
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), RawState::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), RawState::Terminal(_))
    }

    /// Request cancellation (spec §4.C `cancel()`). Idempotent: calling
    /// it twice, or calling it on an already-terminal job, has the same
    /// effect as calling it once (spec property 11).
    pub fn cancel(&self) {
        self.request_cancel(None);
    }

    fn request_cancel(&self, cause: Option<Failure>) {
        let became_cancelling = {
            let mut state = self.inner.state.lock().unwrap();
            if let RawState::Active = &*state {
                *state = RawState::Cancelling;
                true
            } else {
                false
            }
        };

        if let Some(cause) = cause {
            let mut stored = self.inner.cancel_cause.lock().unwrap();
            if stored.is_none() {
                *stored = Some(cause);
            }
        }

        if !became_cancelling {
            return;
        }

        log::debug!("job {:?} ({:?}) cancelling", self.inner.id, self.inner.name);

        // Resolve our own parked continuation, if any, toward Cancellation
        // (spec §5: "already-parked continuations are resolved").
        if let Some(hook) = self.inner.parked.lock().unwrap().take() {
            hook();
        }

        let children: Vec<Weak<JobInner>> = self.inner.children.lock().unwrap().clone();
        for weak in children {
            if let Some(child_inner) = weak.upgrade() {
                Job { inner: child_inner }.request_cancel(None);
            }
        }
    }

    fn register_parked(&self, hook: ParkedHook) {
        *self.inner.parked.lock().unwrap() = Some(hook);
    }

    fn clear_parked(&self) {
        self.inner.parked.lock().unwrap().take();
    }

    /// Suspend until terminal, then unconditionally succeed, discarding
    /// whatever the target's own outcome was (spec §4.C `join()`). The
    /// only failure this can surface is `Cancellation`, and only if the
    /// *awaiting* job was itself cancelled while parked here.
    pub async fn join(&self) -> Result<(), Failure> {
        let inner = self.inner.clone();
        suspend_parked(move |continuation: Continuation<()>| register_join_waiter(&inner, continuation))
            .await
    }

    /// Wait for this job to reach a terminal state, ignoring the calling
    /// job's own cancellation. Used internally by [`Job::finalize_children`]:
    /// a scope tearing down must wait for every child to actually finish,
    /// even a child that is being cancelled because the scope itself was.
    fn wait_terminal_uninterruptible(&self) -> impl Future<Output = ()> {
        let inner = self.inner.clone();
        async move {
            let already_terminal = matches!(&*inner.state.lock().unwrap(), RawState::Terminal(_));
            if already_terminal {
                return;
            }
            let _ = suspend_here(move |continuation: Continuation<()>| {
                register_join_waiter(&inner, continuation)
            })
            .await;
        }
    }

    /// Request cancellation of every still-active child, then wait for
    /// all registered children to reach a terminal state (spec §4.C: "A
    /// Job has not terminal until all its children are terminal", and
    /// the invariant that a terminal transition cancels still-active
    /// children).
    async fn finalize_children(&self) {
        let snapshot: Vec<Job> = self
            .inner
            .children
            .lock()
            .unwrap()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|inner| Job { inner })
            .collect();

        for child in &snapshot {
            child.request_cancel(None);
        }
        for child in &snapshot {
            child.wait_terminal_uninterruptible().await;
        }

        self.inner.children.lock().unwrap().clear();
    }

    fn finish(&self, body_result: Result<(), Failure>) {
        let outcome = match body_result {
            Ok(()) => {
                if self.is_cancelling() {
                    Outcome::Cancelled(self.inner.cancel_cause.lock().unwrap().clone())
                } else {
                    Outcome::Success
                }
            }
            Err(Failure::Cancellation) => Outcome::Cancelled(self.inner.cancel_cause.lock().unwrap().clone()),
            Err(other) => Outcome::Failed(other),
        };

        log::debug!("job {:?} ({:?}) terminal: {:?}", self.inner.id, self.inner.name, outcome);

        *self.inner.state.lock().unwrap() = RawState::Terminal(outcome.clone());

        let waiters: Vec<Waiter> = std::mem::take(&mut *self.inner.waiters.lock().unwrap());
        for waiter in waiters {
            waiter();
        }

        // A real failure keeps propagating upward through every ancestor,
        // not just the immediate parent: a job that ends up Cancelled
        // *because* of a cause (as opposed to a plain `cancel()` with none)
        // forwards that same cause to its own parent exactly as a Failed
        // outcome would. A job cancelled with no cause does not - that's
        // ordinary cancellation, not an unhandled failure bubbling up.
        let propagate = match &outcome {
            Outcome::Failed(failure) if !failure.is_cancellation() => Some(failure.clone()),
            Outcome::Cancelled(Some(cause)) => Some(cause.clone()),
            _ => None,
        };
        if let Some(cause) = propagate {
            if let Some(parent) = &self.inner.parent {
                parent.request_cancel(Some(cause));
            }
        }
    }

    /// The failure that triggered this job's cancellation cascade, if
    /// any and if known yet. Populated once a child's non-cancellation
    /// failure (or an explicit caller) supplies a cause; `None` for a
    /// plain `cancel()` with no failure behind it.
    pub fn cancel_cause(&self) -> Option<Failure> {
        self.inner.cancel_cause.lock().unwrap().clone()
    }
}

fn register_join_waiter(inner: &Arc<JobInner>, continuation: Continuation<()>) -> Option<ParkedHook> {
    let mut state = inner.state.lock().unwrap();
    if matches!(&*state, RawState::Terminal(_)) {
        drop(state);
        continuation.resume(());
        return None;
    }
    inner.waiters.lock().unwrap().push({
        let continuation = continuation.clone();
        Box::new(move || {
            continuation.try_resume(());
        })
    });
    drop(state);
    let cancel_continuation = continuation;
    Some(Box::new(move || {
        cancel_continuation.try_resume_with_failure(Failure::Cancellation);
    }))
}

/// The shared suspension primitive for everything in this crate that
/// waits on the job tree or on a `Channel`: checks the current job's own
/// cancellation state before suspending, and wires whatever the given
/// `handler` wants resolved-on-cancel into the current job's single
/// parked-continuation slot (spec §5: both the initial check and the
/// resolution of already-parked continuations).
///
/// `handler` is given the fresh continuation and returns `None` if it
/// resolved synchronously (no parking needed, spec §4.B's synchronous
/// path) or `Some(hook)` - a closure that, if this job is cancelled
/// before the continuation is otherwise resumed, resolves it toward
/// `Failure::Cancellation`.
pub(crate) fn suspend_parked<T, H>(handler: H) -> impl Future<Output = Result<T, Failure>>
where
    T: Send + 'static,
    H: FnOnce(Continuation<T>) -> Option<ParkedHook> + Send + 'static,
{
    async move {
        let current = Job::current();
        if let Some(job) = &current {
            if job.is_cancelling() {
                return Err(Failure::Cancellation);
            }
        }

        let current_for_handler = current.clone();
        let result = suspend_here(move |continuation: Continuation<T>| {
            let hook = handler(continuation);
            if let (Some(job), Some(hook)) = (&current_for_handler, hook) {
                job.register_parked(hook);
            }
        })
        .await;

        if let Some(job) = &current {
            job.clear_parked();
        }

        result
    }
}

/// A `Job` that additionally carries a typed result slot (spec §3
/// `Deferred[T]`).
pub struct Deferred<T> {
    job: Job,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            job: self.job.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("job", &self.job).finish()
    }
}

impl<T: Send + 'static> Deferred<T> {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn cancel(&self) {
        self.job.cancel();
    }

    pub fn state(&self) -> JobState {
        self.job.state()
    }

    /// Suspend until terminal; yield the value on success, re-raise the
    /// failure on failure, raise `Cancellation` if the awaiting job was
    /// itself cancelled (spec §3 `Deferred::await`). Named `await_value`
    /// because `await` is a reserved keyword in Rust (see DESIGN.md).
    pub async fn await_value(&self) -> Result<T, Failure> {
        self.job.join().await?;
        match &*self.job.inner.state.lock().unwrap() {
            RawState::Terminal(Outcome::Success) => Ok(self
                .result
                .lock()
                .unwrap()
                .take()
                .expect("Deferred completed successfully without storing a result")),
            RawState::Terminal(Outcome::Failed(failure)) => Err(failure.clone()),
            RawState::Terminal(Outcome::Cancelled(_)) => Err(Failure::Cancellation),
            _ => unreachable!("Job::join only resolves Ok(()) once the target is terminal"),
        }
    }
}

/// Chainable configuration for [`launch`]/[`defer`], mirroring
/// [`crate::coroutine::Builder`].
#[derive(Debug, Clone, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.name = Some(name.into());
        self
    }

    /// spec §4.C `launch(context, block) -> Job`.
    pub fn launch<F>(self, context: CoroutineContext, block: F) -> Job
    where
        F: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        spawn_job::<(), F>(context, self.name, block).0
    }

    /// spec §4.C `defer(context, block) -> Deferred[T]`.
    pub fn defer<T, F>(self, context: CoroutineContext, block: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let (job, result) = spawn_job::<T, F>(context, self.name, block);
        Deferred { job, result }
    }
}

fn spawn_job<T, F>(context: CoroutineContext, name: Option<String>, body: F) -> (Job, Arc<Mutex<Option<T>>>)
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    let caller_context = coroutine::current_context().unwrap_or_default();
    let parent = caller_context.get::<Job>().map(|job| (*job).clone());
    let merged = caller_context.merge(&context);

    if merged.get::<Arc<dyn Dispatcher>>().is_none() {
        panic!("launch/defer requires a Dispatcher in the caller's or the supplied context");
    }

    let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::new(JobInner {
        id,
        name,
        state: Mutex::new(RawState::Active),
        parent: parent.clone(),
        children: Mutex::new(Vec::new()),
        waiters: Mutex::new(Vec::new()),
        cancel_cause: Mutex::new(None),
        parked: Mutex::new(None),
    });
    let job = Job { inner: inner.clone() };

    if let Some(parent_job) = &parent {
        parent_job.inner.children.lock().unwrap().push(Arc::downgrade(&inner));
    }

    let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let run_context = merged.with(job.clone());

    let job_for_body = job.clone();
    let result_for_body = result.clone();
    let wrapped = async move {
        let body_result = body.await;
        job_for_body.finalize_children().await;
        let finish_result = match body_result {
            Ok(value) => {
                *result_for_body.lock().unwrap() = Some(value);
                Ok(())
            }
            Err(failure) => Err(failure),
        };
        job_for_body.finish(finish_result);
        Ok::<(), Failure>(())
    };

    coroutine::spawn(run_context, coroutine::Builder::new(), wrapped, |_: Result<(), Failure>| {});

    (job, result)
}

/// spec §4.C `launch(context, block) -> Job`.
pub fn launch<F>(context: CoroutineContext, block: F) -> Job
where
    F: Future<Output = Result<(), Failure>> + Send + 'static,
{
    Builder::new().launch(context, block)
}

/// spec §4.C `defer(context, block) -> Deferred[T]`.
pub fn defer<T, F>(context: CoroutineContext, block: F) -> Deferred<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Failure>> + Send + 'static,
{
    Builder::new().defer(context, block)
}
