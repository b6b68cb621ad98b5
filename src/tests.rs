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

//! Cross-module scenarios from the testable-properties list that don't
//! belong to any single module's own unit tests. Most of that list
//! (deferred round-trip/failure, channel handoff permutations, channel
//! misuse, generator laziness, idempotent cancel, cancellation-at-
//! suspension) is already exercised next to the type it's about
//! (`job.rs`, `channel.rs`, `generator.rs`, `scope.rs`); what's left here
//! needs more than one module wired together to observe.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::context::CoroutineContext;
use crate::dispatcher::InlineDispatcher;
use crate::failure::{Failure, Message};
use crate::job::{launch, Job};
use crate::scope::{run_scope, yield_now};
use std::sync::Arc;

fn inline_context() -> CoroutineContext {
    CoroutineContext::empty().with(Arc::new(InlineDispatcher) as Arc<dyn crate::dispatcher::Dispatcher>)
}

/// Structured order under nested `launch`/`yield`/`join` (spec §8
/// property 1). `run_scope`'s default dispatcher, when nothing else is
/// configured, is an `InlineDispatcher`: `launch(...)` only schedules a
/// child's first poll, it does not run the child to completion, and a
/// resumed continuation is likewise only scheduled, not re-entered on
/// the spot - so this produces the same breadth-first interleaving an
/// explicit work queue would, all on the calling thread.
#[test]
fn structured_order_under_nested_launch_yield_and_join() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let result: Result<(), Failure> = run_scope(CoroutineContext::empty(), {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(1);

            let mid = launch(inline_context(), {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(2);

                    let inner = launch(inline_context(), {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push(3);
                            yield_now().await?;
                            log.lock().unwrap().push(6);
                            Ok(())
                        }
                    });

                    log.lock().unwrap().push(4);
                    yield_now().await?;
                    log.lock().unwrap().push(7);
                    inner.join().await?;
                    Ok(())
                }
            });

            log.lock().unwrap().push(5);
            mid.join().await?;
            log.lock().unwrap().push(8);
            Ok(())
        }
    });

    result.unwrap();
    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

/// Parent cancellation on an unobserved child's user failure (spec §8
/// property 4): a child's non-cancellation failure requests cancellation
/// of its parent, and the parent's own very next suspension point - even
/// one with nothing to do with the child - observes that as
/// `Failure::Cancellation`, not as something it can ignore and carry on
/// past.
#[test]
fn parent_observes_cancellation_from_a_failed_child_at_its_next_suspension() {
    let result: Result<(), Failure> = run_scope(CoroutineContext::empty(), async {
        // `launch` only schedules the child - it hasn't run yet at this
        // point. It runs (and fails) while we're parked in our own
        // `yield_now` below, and that failure's cancel cascade resolves
        // our already-parked continuation directly, rather than us
        // observing `is_cancelling()` on entry to a later suspension.
        let _child = launch(CoroutineContext::empty(), async {
            Err(Failure::from_user_error(Message::new("child blew up")))
        });

        match yield_now().await {
            Err(Failure::Cancellation) => {}
            other => panic!("expected the parent's yield_now to observe Cancellation, got {other:?}"),
        }

        Ok(())
    });

    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "child blew up");
}

/// A failure two levels deep still reaches the root: a grandchild's
/// failure requests cancellation of its own parent, and that parent,
/// ending up `Cancelled` *because of* that cause rather than a plain
/// `cancel()`, forwards the same cause up to the root in turn. A sibling
/// branch that already ran to completion before any of this started is
/// undisturbed - the cascade only ever reaches jobs still active when it
/// arrives, never one already terminal.
#[test]
fn failure_cascades_up_through_every_ancestor() {
    let ran_to_completion = Arc::new(AtomicUsize::new(0));
    let counter = ran_to_completion.clone();

    let result: Result<(), Failure> = run_scope(CoroutineContext::empty(), async move {
        // Under the InlineDispatcher this runs to completion immediately,
        // well before the failing branch below even exists.
        let healthy_branch = launch(CoroutineContext::empty(), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let failing_branch = launch(CoroutineContext::empty(), async {
            let _grandchild = launch(CoroutineContext::empty(), async {
                Err(Failure::from_user_error(Message::new("deep failure")))
            });
            yield_now().await?;
            Ok(())
        });

        let _ = failing_branch.join().await;
        let _ = healthy_branch.join().await;

        assert!(matches!(failing_branch.state(), crate::job::JobState::Cancelled));
        assert!(matches!(healthy_branch.state(), crate::job::JobState::Completed));
        Ok(())
    });

    assert_eq!(result.unwrap_err().to_string(), "deep failure");
    // Already finished before the cascade existed - unaffected by it.
    assert_eq!(ran_to_completion.load(Ordering::SeqCst), 1);
}

/// `Job::current()` is only `Some` while a poll is actually in progress,
/// and reflects whichever job's body is presently running - a sanity
/// check that the per-thread ambient context set up in `coroutine.rs`
/// stays correctly scoped across nested jobs.
#[test]
fn job_current_reflects_whichever_body_is_running() {
    assert!(Job::current().is_none());

    let result: Result<(), Failure> = run_scope(CoroutineContext::empty(), async {
        let outer = Job::current().expect("a job must be current while its body runs");

        let child = launch(CoroutineContext::empty(), async move {
            let inner = Job::current().expect("a job must be current while its body runs");
            assert_ne!(inner.id(), outer.id());
            Ok(())
        });
        child.join().await?;

        Ok(())
    });

    result.unwrap();
    assert!(Job::current().is_none());
}
