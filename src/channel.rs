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

//! `Channel<T>`: a single-slot rendezvous handoff (spec §4.E). There is
//! no buffering - `send` does not return until some `receive` has
//! actually taken the value, and vice versa - and at most one sender and
//! one receiver may be registered at a time; a second concurrent sender
//! (or receiver) is a usage error, not something that queues up.
//!
//! The four states below are exactly the ones spec §4.E names, including
//! `SenderRegistered` - a sender that wants to block on backpressure
//! before it has a value ready, via `register_sender`. What the spec
//! leaves to the implementation is how a parked sender or receiver gets
//! torn down if its own job is cancelled mid-wait: that's the
//! `remove_*_if` family below, each guarded by [`Continuation::ptr_eq`]
//! so a cancel that loses a race against a real handoff doesn't clobber
//! the slot a new registration may have since put there.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::continuation::Continuation;
use crate::failure::Failure;
use crate::job::suspend_parked;

enum State<T> {
    Empty,
    SenderRegistered { continuation: Continuation<()> },
    SenderWaiting { value: T, continuation: Continuation<()> },
    ReceiverWaiting { continuation: Continuation<T> },
}

impl<T> State<T> {
    fn label(&self) -> &'static str {
        match self {
            State::Empty => "Empty",
            State::SenderRegistered { .. } => "SenderRegistered",
            State::SenderWaiting { .. } => "SenderWaiting",
            State::ReceiverWaiting { .. } => "ReceiverWaiting",
        }
    }
}

/// A single-slot rendezvous channel (spec §4.E). Share one instance
/// (typically behind an `Arc`) between the coroutines that send and
/// receive on it.
pub struct Channel<T> {
    state: Mutex<State<T>>,
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("state", &self.state.lock().unwrap().label()).finish()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Channel::new()
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn new() -> Channel<T> {
        Channel {
            state: Mutex::new(State::Empty),
        }
    }

    /// Register intent to send before a value is ready, suspending until
    /// a receiver arrives (spec §4.E `registerSender`). Meant for a
    /// sender that wants to block on backpressure first and only compute
    /// its value once someone is actually waiting for it. Fails
    /// immediately, without suspending, if another sender is already
    /// registered or parked.
    pub async fn register_sender(self: &Arc<Self>) -> Result<(), Failure> {
        {
            let state = self.state.lock().unwrap();
            match &*state {
                State::ReceiverWaiting { .. } => return Ok(()),
                State::SenderWaiting { .. } | State::SenderRegistered { .. } => {
                    return Err(Failure::usage("Channel::register_sender: a sender is already registered"));
                }
                State::Empty => {}
            }
        }

        let this = self.clone();
        suspend_parked(move |continuation: Continuation<()>| {
            let mut state = this.state.lock().unwrap();
            match &*state {
                State::Empty => {
                    *state = State::SenderRegistered {
                        continuation: continuation.clone(),
                    };
                }
                // A receiver slipped in between our fast-path check and
                // here; nothing to register, just let the sender proceed.
                State::ReceiverWaiting { .. } => {
                    drop(state);
                    continuation.resume(());
                    return None;
                }
                State::SenderWaiting { .. } | State::SenderRegistered { .. } => {
                    drop(state);
                    continuation.resume_with_failure(Failure::usage(
                        "Channel::register_sender: a sender is already registered",
                    ));
                    return None;
                }
            }
            drop(state);

            let cancel_continuation = continuation;
            Some(Box::new(move || {
                this.remove_sender_registered_if(&cancel_continuation);
                cancel_continuation.try_resume_with_failure(Failure::Cancellation);
            }) as Box<dyn FnOnce() + Send>)
        })
        .await
    }

    /// Hand `value` to a receiver, suspending until one actually takes it
    /// (spec §4.E `send`). Fails immediately, without suspending, if
    /// another sender is already registered.
    ///
    /// Takes `self: &Arc<Self>` (rather than plain `&self`) so that the
    /// continuation this may have to park lives exactly as long as it
    /// needs to, independent of the borrow of whichever coroutine body
    /// called `send` - the same reason `Job` and `Deferred` hand out
    /// `Arc`-backed clones instead of references.
    pub async fn send(self: &Arc<Self>, value: T) -> Result<(), Failure> {
        // Fast path: a receiver is already parked waiting for us.
        let value = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                State::ReceiverWaiting { .. } => {
                    let previous = std::mem::replace(&mut *state, State::Empty);
                    drop(state);
                    if let State::ReceiverWaiting { continuation } = previous {
                        continuation.resume(value);
                    }
                    return Ok(());
                }
                State::SenderWaiting { .. } => {
                    return Err(Failure::usage("Channel::send: a sender is already registered"));
                }
                State::SenderRegistered { .. } | State::Empty => {}
            }
            value
        };

        let this = self.clone();
        suspend_parked(move |continuation: Continuation<()>| {
            let mut state = this.state.lock().unwrap();
            match &*state {
                State::Empty => {
                    *state = State::SenderWaiting {
                        value,
                        continuation: continuation.clone(),
                    };
                }
                // A receiver slipped in between our fast-path check and
                // here (it was registered after we looked, and raced us
                // to the lock). Hand the value off directly instead of
                // parking.
                State::ReceiverWaiting { .. } => {
                    let previous = std::mem::replace(&mut *state, State::Empty);
                    drop(state);
                    if let State::ReceiverWaiting { continuation: receiver } = previous {
                        receiver.resume(value);
                    }
                    continuation.resume(());
                    return None;
                }
                State::SenderWaiting { .. } => {
                    drop(state);
                    continuation.resume_with_failure(Failure::usage(
                        "Channel::send: a sender is already registered",
                    ));
                    return None;
                }
                // We already hold a registration slot (the `registerSender`
                // row "same sender upgrading"): replace it with the real,
                // value-carrying wait and let the superseded registration
                // continuation go too, since we're taking over its spot.
                State::SenderRegistered { .. } => {
                    let previous = std::mem::replace(
                        &mut *state,
                        State::SenderWaiting {
                            value,
                            continuation: continuation.clone(),
                        },
                    );
                    drop(state);
                    if let State::SenderRegistered { continuation: registered } = previous {
                        registered.resume(());
                    }
                    let cancel_continuation = continuation;
                    return Some(Box::new(move || {
                        this.remove_sender_if(&cancel_continuation);
                        cancel_continuation.try_resume_with_failure(Failure::Cancellation);
                    }) as Box<dyn FnOnce() + Send>);
                }
            }
            drop(state);

            let cancel_continuation = continuation;
            Some(Box::new(move || {
                this.remove_sender_if(&cancel_continuation);
                cancel_continuation.try_resume_with_failure(Failure::Cancellation);
            }) as Box<dyn FnOnce() + Send>)
        })
        .await
    }

    /// Take a value from a sender, suspending until one is registered
    /// (spec §4.E `receive`). Fails immediately, without suspending, if
    /// another receiver is already registered.
    pub async fn receive(self: &Arc<Self>) -> Result<T, Failure> {
        {
            let mut state = self.state.lock().unwrap();
            match &*state {
                State::SenderWaiting { .. } => {
                    let previous = std::mem::replace(&mut *state, State::Empty);
                    drop(state);
                    if let State::SenderWaiting { value, continuation } = previous {
                        continuation.resume(());
                        return Ok(value);
                    }
                    unreachable!("just matched SenderWaiting above");
                }
                State::ReceiverWaiting { .. } => {
                    return Err(Failure::usage("Channel::receive: a receiver is already registered"));
                }
                State::SenderRegistered { .. } | State::Empty => {}
            }
        }

        let this = self.clone();
        suspend_parked(move |continuation: Continuation<T>| {
            let mut state = this.state.lock().unwrap();
            match &*state {
                State::Empty => {
                    *state = State::ReceiverWaiting {
                        continuation: continuation.clone(),
                    };
                }
                State::SenderWaiting { .. } => {
                    let previous = std::mem::replace(&mut *state, State::Empty);
                    drop(state);
                    if let State::SenderWaiting { value, continuation: sender } = previous {
                        sender.resume(());
                        continuation.resume(value);
                    }
                    return None;
                }
                State::ReceiverWaiting { .. } => {
                    drop(state);
                    continuation.resume_with_failure(Failure::usage(
                        "Channel::receive: a receiver is already registered",
                    ));
                    return None;
                }
                // The registered sender is released to go compute and send
                // its value; we re-park as an ordinary waiting receiver in
                // the same step so that sender's `send` - which will see
                // `ReceiverWaiting` - completes the handoff normally. The
                // spec's literal intermediate `Empty` is never externally
                // observable since we never drop the lock in between.
                State::SenderRegistered { .. } => {
                    let previous = std::mem::replace(
                        &mut *state,
                        State::ReceiverWaiting {
                            continuation: continuation.clone(),
                        },
                    );
                    drop(state);
                    if let State::SenderRegistered { continuation: sender } = previous {
                        sender.resume(());
                    }
                    let cancel_continuation = continuation;
                    return Some(Box::new(move || {
                        this.remove_receiver_if(&cancel_continuation);
                        cancel_continuation.try_resume_with_failure(Failure::Cancellation);
                    }) as Box<dyn FnOnce() + Send>);
                }
            }
            drop(state);

            let cancel_continuation = continuation;
            Some(Box::new(move || {
                this.remove_receiver_if(&cancel_continuation);
                cancel_continuation.try_resume_with_failure(Failure::Cancellation);
            }) as Box<dyn FnOnce() + Send>)
        })
        .await
    }

    fn remove_sender_registered_if(&self, continuation: &Continuation<()>) {
        let mut state = self.state.lock().unwrap();
        let matches = matches!(&*state, State::SenderRegistered { continuation: parked } if parked.ptr_eq(continuation));
        if matches {
            *state = State::Empty;
        }
    }

    fn remove_sender_if(&self, continuation: &Continuation<()>) {
        let mut state = self.state.lock().unwrap();
        let matches = matches!(&*state, State::SenderWaiting { continuation: parked, .. } if parked.ptr_eq(continuation));
        if matches {
            *state = State::Empty;
        }
    }

    fn remove_receiver_if(&self, continuation: &Continuation<T>) {
        let mut state = self.state.lock().unwrap();
        let matches = matches!(&*state, State::ReceiverWaiting { continuation: parked } if parked.ptr_eq(continuation));
        if matches {
            *state = State::Empty;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::CoroutineContext;
    use crate::dispatcher::{Dispatcher, PoolDispatcher};
    use crate::job::launch;
    use crate::scope::run_scope;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn receiver_registered_first_then_matched_by_a_send() {
        let result = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let receiver_channel = channel.clone();
            let receiver = crate::job::defer::<i32, _>(ctx.clone(), async move { receiver_channel.receive().await });

            // Give the receiver a chance to register before we send.
            crate::scope::delay(Duration::from_millis(10)).await?;
            channel.send(7).await?;

            let received = receiver.await_value().await?;
            Ok(received)
        });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn sender_parked_first_then_matched_by_a_receive() {
        let result = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let sender_channel = channel.clone();
            let sender = launch(ctx.clone(), async move { sender_channel.send(9).await });

            crate::scope::delay(Duration::from_millis(10)).await?;
            let received = channel.receive().await?;
            sender.join().await?;
            Ok(received)
        });
        assert_eq!(result.unwrap(), 9);
    }

    #[test]
    fn sender_registers_first_then_receive_completes_the_handoff() {
        let result = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let sender_channel = channel.clone();
            let sender = launch(ctx.clone(), async move {
                sender_channel.register_sender().await?;
                sender_channel.send(11).await
            });

            // Give the sender a chance to register before we receive.
            crate::scope::delay(Duration::from_millis(10)).await?;
            let received = channel.receive().await?;
            sender.join().await?;
            Ok(received)
        });
        assert_eq!(result.unwrap(), 11);
    }

    #[test]
    fn register_sender_resolves_immediately_when_a_receiver_already_waits() {
        let result = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let receiver_channel = channel.clone();
            let receiver = crate::job::defer::<i32, _>(ctx.clone(), async move { receiver_channel.receive().await });

            crate::scope::delay(Duration::from_millis(10)).await?;
            channel.register_sender().await?;
            channel.send(5).await?;

            let received = receiver.await_value().await?;
            Ok(received)
        });
        assert_eq!(result.unwrap(), 5);
    }

    #[test]
    fn second_concurrent_sender_is_a_usage_error() {
        let result: Result<(), Failure> = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let first_channel = channel.clone();
            let _first = launch(ctx.clone(), async move {
                let _ = first_channel.send(1).await;
                Ok(())
            });
            crate::scope::delay(Duration::from_millis(10)).await?;

            match channel.send(2).await {
                Err(Failure::Usage(_)) => Ok(()),
                other => panic!("expected a usage error, got {other:?}"),
            }
        });
        result.unwrap();
    }

    #[test]
    fn cancelling_a_parked_receiver_frees_the_slot_for_a_later_sender() {
        let result = run_scope(CoroutineContext::empty(), async {
            let channel: Arc<Channel<i32>> = Arc::new(Channel::new());
            let pool = PoolDispatcher::new(2);
            let ctx = CoroutineContext::empty().with(pool as Arc<dyn Dispatcher>);

            let receiver_channel = channel.clone();
            let receiver = launch(ctx.clone(), async move {
                let _ = receiver_channel.receive().await;
                Ok(())
            });
            crate::scope::delay(Duration::from_millis(10)).await?;
            receiver.cancel();
            receiver.join().await?;

            // The slot must be Empty again, not stuck as ReceiverWaiting -
            // prove it by running a fresh handoff through the same channel.
            let second_channel = channel.clone();
            let second_receiver = crate::job::defer::<i32, _>(ctx.clone(), async move { second_channel.receive().await });
            crate::scope::delay(Duration::from_millis(10)).await?;
            channel.send(42).await?;
            let received = second_receiver.await_value().await?;
            Ok(received)
        });
        assert_eq!(result.unwrap(), 42);
    }
}
