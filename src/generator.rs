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

//! `Generator<T>`: a demand-driven iterator built on top of a suspendable
//! block (spec §4.E′). Unlike `Job`/`Deferred`, a generator is never
//! submitted through a `Dispatcher` - `hasNext`/`next` pull it forward
//! one suspension point at a time on whichever thread is iterating it,
//! so advancing it is synchronous, not scheduled.
//!
//! That pull is built directly on [`crate::continuation::suspend_here`]:
//! `yield_value` hands its continuation to a handler that stashes it
//! alongside the produced value instead of resuming it, so the body
//! future stays `Pending` until the consumer comes back for more and
//! resumes that stashed continuation itself. This is the same primitive
//! `Job::join` and `Channel` build on (see `job.rs`, `channel.rs`); what
//! differs here is who does the resuming - a dispatcher there, the
//! consumer's own `has_next` call here.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::continuation::{suspend_here, Continuation};
use crate::failure::Failure;

/// The capability a generator body uses to produce values (spec §4.E′:
/// "the block captures a `Generator[T]` capability exposing
/// `yield(value)`"). Named `Yielder` rather than `Generator` to leave
/// that name for the iterator type itself.
pub struct Yielder<T> {
    slot: Arc<Mutex<Option<T>>>,
    resume: Arc<Mutex<Option<Continuation<()>>>>,
}

impl<T> Clone for Yielder<T> {
    fn clone(&self) -> Self {
        Yielder {
            slot: self.slot.clone(),
            resume: self.resume.clone(),
        }
    }
}

impl<T: Send + 'static> Yielder<T> {
    /// Produce `value` and suspend until the consumer pulls the next
    /// item. Resolves once `has_next`/`next` has taken `value` out of the
    /// slot and decided to advance the body further.
    pub async fn yield_value(&self, value: T) -> Result<(), Failure> {
        let slot = self.slot.clone();
        let resume = self.resume.clone();
        suspend_here(move |continuation: Continuation<()>| {
            *slot.lock().unwrap() = Some(value);
            *resume.lock().unwrap() = Some(continuation);
        })
        .await
    }
}

/// A demand-driven iterator over the values a suspendable block yields
/// (spec §4.E′'s `Sequence[T]`). Construct one with [`generate`].
///
/// `Generator` also implements [`Iterator`] (`Item = Result<T, Failure>`)
/// for the common case of just walking every value; `has_next`/`next_value`
/// are the lower-level pull primitives the spec names directly, for
/// callers that want to inspect a failure without it being wrapped in an
/// `Option`-ended iteration.
pub struct Generator<T> {
    future: Pin<Box<dyn Future<Output = Result<(), Failure>> + Send>>,
    slot: Arc<Mutex<Option<T>>>,
    resume: Arc<Mutex<Option<Continuation<()>>>>,
    current: Option<T>,
    terminal: bool,
}

impl<T: Send + 'static> Generator<T> {
    /// Advance to the next value if one isn't already buffered (spec
    /// §4.E′ `hasNext`). Returns `Ok(false)` once the body has returned,
    /// and re-raises the body's failure, if any, instead of returning.
    pub fn has_next(&mut self) -> Result<bool, Failure> {
        if self.terminal {
            return Ok(false);
        }
        if self.current.is_some() {
            return Ok(true);
        }

        // Resume whatever the previous `yield_value` parked, letting the
        // body run forward from there.
        if let Some(continuation) = self.resume.lock().unwrap().take() {
            continuation.resume(());
        }

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match self.future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                let value = self
                    .slot
                    .lock()
                    .unwrap()
                    .take()
                    .expect("generator body suspended without yielding a value");
                self.current = Some(value);
                Ok(true)
            }
            Poll::Ready(Ok(())) => {
                self.terminal = true;
                Ok(false)
            }
            Poll::Ready(Err(failure)) => {
                self.terminal = true;
                Err(failure)
            }
        }
    }

    /// The buffered value, calling [`has_next`](Generator::has_next)
    /// lazily first if it hasn't been called yet (spec §4.E′ `next`).
    /// Silently returns `None` on a failure; use `has_next` directly (or
    /// this type's `Iterator` impl) to observe it.
    pub fn next_value(&mut self) -> Option<T> {
        if self.current.is_none() {
            let _ = self.has_next();
        }
        self.current.take()
    }
}

impl<T: Send + 'static> Iterator for Generator<T> {
    type Item = Result<T, Failure>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(Ok(self
                .current
                .take()
                .expect("has_next returned true without a buffered value"))),
            Ok(false) => None,
            Err(failure) => Some(Err(failure)),
        }
    }
}

/// `generate(block) -> Sequence[T]` (spec §4.E′). `block` receives a
/// [`Yielder<T>`] and nothing is run until the returned [`Generator`] is
/// first pulled.
pub fn generate<T, F, Fut>(block: F) -> Generator<T>
where
    T: Send + 'static,
    F: FnOnce(Yielder<T>) -> Fut,
    Fut: Future<Output = Result<(), Failure>> + Send + 'static,
{
    let slot = Arc::new(Mutex::new(None));
    let resume = Arc::new(Mutex::new(None));
    let yielder = Yielder {
        slot: slot.clone(),
        resume: resume.clone(),
    };

    Generator {
        future: Box::pin(block(yielder)),
        slot,
        resume,
        current: None,
        terminal: false,
    }
}

/// A generator is driven synchronously by its own consumer, never by a
/// `Dispatcher`, so the only thing its internal poll ever needs from a
/// `Waker` is to exist; nothing ever calls `wake` on it.
fn noop_waker() -> Waker {
    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::failure::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn finite_generator_produces_every_value_then_stops() {
        let mut gen = generate(|y: Yielder<i32>| async move {
            y.yield_value(1).await?;
            y.yield_value(2).await?;
            Ok(())
        });

        assert_eq!(gen.has_next().unwrap(), true);
        assert_eq!(gen.next_value(), Some(1));
        assert_eq!(gen.has_next().unwrap(), true);
        assert_eq!(gen.next_value(), Some(2));
        assert_eq!(gen.has_next().unwrap(), false);
        assert_eq!(gen.next_value(), None);
    }

    #[test]
    fn iterator_impl_collects_the_same_sequence() {
        let gen = generate(|y: Yielder<i32>| async move {
            y.yield_value(1).await?;
            y.yield_value(2).await?;
            Ok(())
        });

        let values: Vec<i32> = gen.map(Result::unwrap).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn infinite_generator_runs_its_body_at_most_k_suspension_points_for_k_pulls() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_in_body = steps.clone();

        let gen = generate(move |y: Yielder<u64>| {
            let steps = steps_in_body.clone();
            async move {
                let mut n = 0u64;
                loop {
                    steps.fetch_add(1, Ordering::SeqCst);
                    y.yield_value(n).await?;
                    n += 1;
                }
            }
        });

        let first_three: Vec<u64> = gen.take(3).map(Result::unwrap).collect();
        assert_eq!(first_three, vec![0, 1, 2]);
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_failure_from_the_body_is_reraised_through_has_next() {
        let mut gen = generate(|y: Yielder<i32>| async move {
            y.yield_value(1).await?;
            Err(Failure::from_user_error(Message::new("generator blew up")))
        });

        assert_eq!(gen.has_next().unwrap(), true);
        assert_eq!(gen.next_value(), Some(1));
        let err = gen.has_next().unwrap_err();
        assert_eq!(err.to_string(), "generator blew up");
    }

    #[test]
    fn iterator_impl_surfaces_the_failure_as_the_last_item() {
        let gen = generate(|y: Yielder<i32>| async move {
            y.yield_value(1).await?;
            Err(Failure::from_user_error(Message::new("generator blew up")))
        });

        let items: Vec<Result<i32, Failure>> = gen.collect();
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), 1);
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "generator blew up");
    }
}
