// Copyright 2025 The sctp-channel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::api::ChannelError;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded executor owning all I/O and state transitions of the channels
/// pinned to it.
///
/// Tasks submitted from the owner thread with [`EventLoop::run`] execute inline; tasks
/// submitted from any other thread are enqueued and execute on the owner in FIFO
/// submission order. Dropping the last handle shuts the worker down; tasks still queued
/// at that point are dropped, which fails their pending operation futures.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    thread_id: ThreadId,
}

impl EventLoop {
    /// Spawns a new event loop worker.
    pub fn new() -> EventLoop {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name("sctp-event-loop".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn the event loop thread: {}", e));
        let thread_id = handle.thread().id();
        EventLoop { inner: Arc::new(Inner { tx: Mutex::new(Some(tx)), thread_id }) }
    }

    /// Returns true when the calling thread is the owner.
    pub fn in_event_loop(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Enqueues a task for execution on the owner, regardless of the calling thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let guard = self.inner.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            // A send only fails when the worker is gone; the dropped task then fails
            // its promise.
            let _ = tx.send(Box::new(task));
        }
    }

    /// Runs a task on the owner: inline when already there, enqueued otherwise.
    pub fn run(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_event_loop() {
            task();
        } else {
            self.execute(task);
        }
    }

    /// Stops accepting tasks and lets the worker drain and exit.
    pub fn shutdown(&self) {
        self.inner.tx.lock().unwrap().take();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

enum FutureState {
    Pending,
    Done(Result<(), ChannelError>),
}

struct Shared {
    state: Mutex<FutureState>,
    cond: Condvar,
}

impl Shared {
    fn complete(&self, result: Result<(), ChannelError>) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, FutureState::Pending) {
            *state = FutureState::Done(result);
            self.cond.notify_all();
        }
    }
}

/// The write half of an operation future. Completed at most once; dropping an
/// uncompleted promise fails the future with [`ChannelError::ClosedChannel`].
pub struct OpPromise {
    shared: Option<Arc<Shared>>,
}

impl OpPromise {
    /// Creates a connected promise/future pair.
    pub fn pair() -> (OpPromise, OpFuture) {
        let shared = Arc::new(Shared {
            state: Mutex::new(FutureState::Pending),
            cond: Condvar::new(),
        });
        (OpPromise { shared: Some(Arc::clone(&shared)) }, OpFuture { shared })
    }

    pub fn complete(mut self, result: Result<(), ChannelError>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, error: ChannelError) {
        self.complete(Err(error));
    }
}

impl Drop for OpPromise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(ChannelError::ClosedChannel));
        }
    }
}

/// The read half of an operation future. Completes on the owner of the channel the
/// operation was submitted to.
pub struct OpFuture {
    shared: Arc<Shared>,
}

impl OpFuture {
    /// Blocks until the operation completes and returns its result.
    pub fn wait(self) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match mem_take_done(&mut state) {
                Some(result) => return result,
                None => state = self.shared.cond.wait(state).unwrap(),
            }
        }
    }

    /// Blocks up to `timeout` for completion. Returns the future unchanged on expiry.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<(), ChannelError>, OpFuture> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if let Some(result) = mem_take_done(&mut state) {
                return Ok(result);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                drop(state);
                return Err(self);
            }
            let (guard, _) = self.shared.cond.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}

fn mem_take_done(state: &mut FutureState) -> Option<Result<(), ChannelError>> {
    match state {
        FutureState::Pending => None,
        FutureState::Done(_) => {
            let FutureState::Done(result) = std::mem::replace(state, FutureState::Pending) else {
                return None;
            };
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_thread_is_not_the_owner() {
        let event_loop = EventLoop::new();
        assert!(!event_loop.in_event_loop());
    }

    #[test]
    fn tasks_observe_the_owner_thread() {
        let event_loop = EventLoop::new();
        let (promise, future) = OpPromise::pair();
        let inner = event_loop.clone();
        event_loop.execute(move || {
            if inner.in_event_loop() {
                promise.succeed();
            } else {
                promise.fail(ChannelError::ClosedChannel);
            }
        });
        assert!(future.wait().is_ok());
    }

    #[test]
    fn tasks_from_one_thread_run_in_submission_order() {
        let event_loop = EventLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for i in 0..32 {
            let (promise, future) = OpPromise::pair();
            let seen = Arc::clone(&seen);
            event_loop.execute(move || {
                seen.lock().unwrap().push(i);
                promise.succeed();
            });
            futures.push(future);
        }
        for future in futures {
            future.wait().unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn run_executes_inline_on_the_owner() {
        let event_loop = EventLoop::new();
        let (promise, future) = OpPromise::pair();
        let inner = event_loop.clone();
        event_loop.run(move || {
            // Submitted off-loop, so this re-posts; the nested run is then inline.
            let (nested_promise, nested_future) = OpPromise::pair();
            inner.run(move || nested_promise.succeed());
            promise.complete(nested_future.wait_timeout(Duration::from_millis(0)).unwrap_or(
                Err(ChannelError::Timeout),
            ));
        });
        assert!(future.wait().is_ok());
    }

    #[test]
    fn dropped_promise_fails_with_closed_channel() {
        let (promise, future) = OpPromise::pair();
        drop(promise);
        assert!(matches!(future.wait(), Err(ChannelError::ClosedChannel)));
    }

    #[test]
    fn tasks_queued_after_shutdown_fail_their_futures() {
        let event_loop = EventLoop::new();
        event_loop.shutdown();
        let (promise, future) = OpPromise::pair();
        event_loop.execute(move || promise.succeed());
        assert!(matches!(future.wait(), Err(ChannelError::ClosedChannel)));
    }

    #[test]
    fn wait_timeout_returns_the_future_when_pending() {
        let (_promise, future) = OpPromise::pair();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_err());
    }
}
