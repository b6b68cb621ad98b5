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

//! `Dispatcher`: the strategy object that decides on which thread a
//! continuation is resumed (spec §4.D). The teacher's `Scheduler`
//! (`scheduler.rs`) picked up ready coroutines with a work-stealing
//! deque; per spec §1 ("No work stealing; dispatch is delegated to
//! pluggable executors") that scheduling policy is explicitly out of
//! scope here, so the built-in pool dispatcher below is a plain shared
//! work queue instead.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules a task for execution on some thread under the dispatcher's
/// control.
///
/// Dispatchers must guarantee that submitted tasks run to
/// completion-or-suspension without preemption by the runtime itself
/// (spec §4.D).
pub trait Dispatcher: Send + Sync + fmt::Debug {
    fn submit(&self, task: Task);
}

thread_local! {
    // A `submit` reached from inside an already-running inline task (a
    // `launch`/`yield_now`/wake resubmission fired while this thread is
    // already draining) doesn't run immediately: it queues behind
    // whatever's ahead of it, and the outermost `submit` call on this
    // thread drains the queue breadth-first. Without this, a coroutine's
    // own continuation resuming itself recursively unwinds the *entire*
    // subtree to completion inside the first `launch`, instead of
    // `launch` returning once its child reaches its own first suspension
    // (spec §4.C: "fails synchronously only if the Dispatcher refuses
    // submission").
    static INLINE_QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static INLINE_DRAINING: Cell<bool> = Cell::new(false);
}

/// Runs `task` synchronously on the calling thread, interleaving with any
/// other task queued on the same thread breadth-first rather than
/// recursing depth-first. Used when the programmer explicitly opts out
/// of thread hand-off; it is also the dispatcher [`crate::scope::run_scope`]
/// installs by default, so a fresh scope with no other dispatcher in its
/// context never spawns a thread of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn submit(&self, task: Task) {
        INLINE_QUEUE.with(|queue| queue.borrow_mut().push_back(task));

        if INLINE_DRAINING.with(Cell::get) {
            // Already draining on this thread; whoever's running that loop
            // will reach this task in turn.
            return;
        }

        INLINE_DRAINING.with(|draining| draining.set(true));
        loop {
            let next = INLINE_QUEUE.with(|queue| queue.borrow_mut().pop_front());
            match next {
                Some(task) => task(),
                None => break,
            }
        }
        INLINE_DRAINING.with(|draining| draining.set(false));
    }
}

/// Forwards submitted tasks to a fixed-size pool of worker threads
/// sharing one queue. Dropping the last handle to a `PoolDispatcher`
/// shuts its workers down once they drain the queue.
pub struct PoolDispatcher {
    sender: crossbeam_channel::Sender<Task>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl PoolDispatcher {
    /// Spawn a pool with `size` worker threads. `size` must be at least 1.
    pub fn new(size: usize) -> Arc<PoolDispatcher> {
        assert!(size >= 1, "PoolDispatcher needs at least one worker thread");

        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("coroutine-pool-{index}"))
                .spawn(move || {
                    for task in receiver.iter() {
                        task();
                    }
                    log::debug!("pool worker {index} shutting down, queue closed");
                })
                .expect("failed to spawn pool dispatcher worker thread");
            workers.push(handle);
        }

        Arc::new(PoolDispatcher {
            sender,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// A pool sized to the number of available CPUs, the teacher's own
    /// default for `Scheduler::run` (and the role `num_cpus` plays as a
    /// dev-dependency there; it is promoted to a normal dependency here
    /// because this default is part of the public API).
    pub fn default_sized() -> Arc<PoolDispatcher> {
        PoolDispatcher::new(num_cpus::get().max(1))
    }

    pub fn worker_count(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for PoolDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolDispatcher")
            .field("size", &self.size)
            .finish()
    }
}

impl Dispatcher for PoolDispatcher {
    fn submit(&self, task: Task) {
        if self.sender.send(task).is_err() {
            log::error!("PoolDispatcher: all worker threads have shut down, dropping task");
        }
    }
}

impl Drop for PoolDispatcher {
    fn drop(&mut self) {
        // Dropping `sender` (implicitly, when this is the last Arc) closes the
        // channel; the loop in each worker then exits on its own. We still join
        // here so that a dispatcher's lifetime bounds its workers' lifetime.
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Forwards submitted tasks to one dedicated worker thread, serializing
/// everything resumed through it. Stands in for "a specific serializing
/// executor (e.g., a UI event loop)" (spec §4.D); real UI-toolkit
/// adapters are out of scope (spec §1) and would implement [`Dispatcher`]
/// themselves against their own event loop instead of using this type.
pub struct SingleThreadDispatcher {
    sender: crossbeam_channel::Sender<Task>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SingleThreadDispatcher {
    pub fn new(name: impl Into<String>) -> Arc<SingleThreadDispatcher> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                }
            })
            .expect("failed to spawn single-thread dispatcher worker");

        Arc::new(SingleThreadDispatcher {
            sender,
            worker: Mutex::new(Some(handle)),
        })
    }
}

impl fmt::Debug for SingleThreadDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleThreadDispatcher").finish()
    }
}

impl Dispatcher for SingleThreadDispatcher {
    fn submit(&self, task: Task) {
        if self.sender.send(task).is_err() {
            log::error!("SingleThreadDispatcher: worker thread has shut down, dropping task");
        }
    }
}

impl Drop for SingleThreadDispatcher {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
