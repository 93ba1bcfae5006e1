// Single-threaded I/O event demultiplexer with callback-based dispatch
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2024 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2024 Cyphernet Labs, IDCS, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel as chan;

use crate::event::ControlChannel;
use crate::poller::{IoType, Poller};
use crate::Event;

/// Token reserved for the control channel in the epoll registration; watched
/// descriptors get tokens starting from 1.
const CTRL_TOKEN: u64 = 0;

/// Command bit asking the dispatch loop to return from [`Reactor::run`].
const CTRL_STOP: u64 = 1 << 0;
/// Command bit asking the dispatch loop to start probing for quiescence.
const CTRL_WAIT_FOR_IDLE: u64 = 1 << 1;

/// Poll timeout used while probing for quiescence.
const IDLE_PROBE_TIMEOUT: Duration = Duration::from_millis(30);

/// Callback invoked by the reactor thread when the watched descriptor is
/// ready for the corresponding I/O direction.
///
/// Callbacks run with no reactor lock held and may call back into the
/// [`Reactor`] API, including unregistering their own reactable. They must
/// not block for unbounded time: the whole reactor is stalled while a
/// callback runs.
pub type ReadyCallback = Box<dyn Fn() + Send + Sync>;

/// Identifier of a registration within a [`Reactor`], returned by
/// [`Reactor::register`].
///
/// Identifiers are stable and never reused by the same reactor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("reactable#{0}")]
pub struct ReactableId(u64);

/// Record binding one watched descriptor to its callbacks.
struct Reactable {
    fd: RawFd,
    on_read_ready: Option<ReadyCallback>,
    on_write_ready: Option<ReadyCallback>,
    state: Mutex<ReactableState>,
}

/// Mutable part of a [`Reactable`], guarded by its own lock. The lock is
/// only ever acquired after the registry lock (when both are needed) and is
/// never held across a callback or a blocking call.
#[derive(Default)]
struct ReactableState {
    /// Set by the dispatch loop for the duration of this reactable's
    /// callbacks.
    is_executing: bool,
    /// Set by [`Reactor::unregister`] when destruction had to be deferred
    /// because a callback was in flight.
    removed: bool,
    /// Completion signal armed together with `removed`; fired by the
    /// dispatch loop once the in-flight callback has returned.
    finished: Option<chan::Sender<()>>,
}

/// State behind the reactor's table lock.
struct Registry {
    next_id: u64,
    reactables: HashMap<u64, Arc<Reactable>>,
    /// One-shot promise armed by [`Reactor::wait_for_idle`].
    idle_promise: Option<chan::Sender<()>>,
    /// Observer side of the completion signal of the most recent deferred
    /// unregistration.
    unregister_finished: Option<chan::Receiver<()>>,
}

/// A single-threaded I/O reactor.
///
/// The reactor watches a set of file descriptors and dispatches the
/// callbacks supplied at [`Reactor::register`] time when those descriptors
/// become ready. One dedicated thread must call [`Reactor::run`], which
/// blocks demultiplexing events until [`Reactor::stop`]; every other method
/// may be called from any thread, including from inside a callback running
/// on the reactor thread.
///
/// Within one readiness batch callbacks fire in kernel-delivery order;
/// across batches no ordering is guaranteed. A reactor must not be dropped
/// before `run` has returned and all registrations have been removed.
pub struct Reactor {
    poller: Poller,
    ctrl: ControlChannel,
    running: AtomicBool,
    registry: Mutex<Registry>,
}

impl Reactor {
    /// Creates a reactor with an empty registration table.
    ///
    /// Opens the kernel readiness engine and the internal control channel;
    /// either failing is unrecoverable and surfaces as the returned error.
    pub fn new() -> io::Result<Reactor> {
        let poller = Poller::new()?;
        let ctrl = ControlChannel::new()?;
        poller.add(ctrl.as_raw_fd(), CTRL_TOKEN, IoType::read_only())?;
        Ok(Reactor {
            poller,
            ctrl,
            running: AtomicBool::new(false),
            registry: Mutex::new(Registry {
                next_id: CTRL_TOKEN + 1,
                reactables: empty!(),
                idle_promise: None,
                unregister_finished: None,
            }),
        })
    }

    /// Produces a new wakeable [`Event`] owned by the caller.
    pub fn new_event(&self) -> io::Result<Event> {
        Event::new()
    }

    /// Starts watching a descriptor, dispatching `on_read_ready` when it has
    /// data to read (or has hung up or errored) and `on_write_ready` when it
    /// is ready for writing. A direction with no callback is not watched.
    ///
    /// The descriptor stays owned by the caller and must remain open until
    /// [`Reactor::unregister`] returns (or, when unregistration was
    /// deferred, until the completion signal fires).
    ///
    /// # Panics
    ///
    /// Panics if the kernel rejects the registration.
    pub fn register(
        &self,
        fd: &impl AsRawFd,
        on_read_ready: Option<ReadyCallback>,
        on_write_ready: Option<ReadyCallback>,
    ) -> ReactableId {
        let fd = fd.as_raw_fd();
        let io = IoType {
            read: on_read_ready.is_some(),
            write: on_write_ready.is_some(),
        };
        let reactable = Arc::new(Reactable {
            fd,
            on_read_ready,
            on_write_ready,
            state: Mutex::new(ReactableState::default()),
        });
        let id = {
            let mut registry = self.registry.lock().expect("reactor registry poisoned");
            let id = ReactableId(registry.next_id);
            registry.next_id += 1;
            registry.reactables.insert(id.0, reactable);
            id
        };
        // The kernel call happens with no lock held; events for this token
        // cannot be delivered before the registration below completes.
        self.poller
            .add(fd, id.0, io)
            .unwrap_or_else(|err| panic!("could not register fd {fd} with epoll: {err}"));
        log::debug!(target: "reactor", "Registered {id} (fd={fd}, io={io})");
        id
    }

    /// Stops watching a registration and destroys its record.
    ///
    /// When the reactable's callback is executing at the time of the call
    /// (which includes a callback unregistering itself), destruction is
    /// deferred until the callback returns and can be awaited with
    /// [`Reactor::wait_for_unregistered_reactable`]. Otherwise the record is
    /// destroyed before this method returns and its callbacks will never
    /// fire again.
    ///
    /// A descriptor already closed by its owner is tolerated (the kernel
    /// reports it as not registered, which is logged and ignored).
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to a live registration of this
    /// reactor, or on any kernel removal error other than "no such entry".
    pub fn unregister(&self, id: ReactableId) {
        // Removing the table entry is what invalidates the reactable: any
        // event for it still sitting in the current kernel batch will miss
        // the dispatch loop's lookup and be skipped. The table lock covers
        // only this step and is released before any kernel call.
        let reactable = {
            let mut registry = self.registry.lock().expect("reactor registry poisoned");
            registry
                .reactables
                .remove(&id.0)
                .unwrap_or_else(|| panic!("unregistering unknown {id}"))
        };

        let deferred = {
            let mut state = reactable.state.lock().expect("reactable state poisoned");
            match self.poller.remove(reactable.fd) {
                Ok(true) => {}
                Ok(false) => {
                    log::info!(target: "reactor", "{id} (fd={}) was not registered with epoll; \
                        the descriptor was probably closed by its owner", reactable.fd)
                }
                Err(err) => panic!("could not unregister epoll fd {}: {err}", reactable.fd),
            }

            if state.is_executing {
                // The dispatch loop is inside one of this reactable's
                // callbacks; it destroys the record once the callback
                // returns and fires the completion signal.
                state.removed = true;
                let (finished_send, finished_recv) = chan::bounded(1);
                state.finished = Some(finished_send);
                log::debug!(target: "reactor", "Deferred destruction of executing {id} (fd={})",
                    reactable.fd);
                Some(finished_recv)
            } else {
                log::debug!(target: "reactor", "Unregistered {id} (fd={})", reactable.fd);
                None
            }
        };

        if let Some(finished_recv) = deferred {
            // Publish the observer side for
            // `wait_for_unregistered_reactable`. The reactable lock is
            // already released, keeping the table-then-reactable lock
            // order; the completion message cannot be lost in between
            // because the channel buffers it.
            self.registry.lock().expect("reactor registry poisoned").unregister_finished =
                Some(finished_recv);
        }
        // In the immediate case the last reference goes out of scope here,
        // destroying the record together with its callbacks.
    }

    /// Changes which I/O directions are watched for a registration. The
    /// callbacks given at registration time are kept as they are, so
    /// enabling a direction with no callback produces events which are
    /// dispatched to nobody.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to a live registration of this
    /// reactor or if the kernel rejects the modification.
    pub fn modify_registration(&self, id: ReactableId, io: IoType) {
        let reactable = {
            let registry = self.registry.lock().expect("reactor registry poisoned");
            registry
                .reactables
                .get(&id.0)
                .cloned()
                .unwrap_or_else(|| panic!("modifying unknown {id}"))
        };
        self.poller.modify(reactable.fd, id.0, io).unwrap_or_else(|err| {
            panic!("could not modify epoll registration of fd {}: {err}", reactable.fd)
        });
        log::debug!(target: "reactor", "Modified {id} (fd={}) to watch {io}", reactable.fd);
    }

    /// Runs the dispatch loop on the calling thread until [`Reactor::stop`]
    /// is observed.
    ///
    /// # Panics
    ///
    /// Panics when the reactor is already running on another thread, or on
    /// an unrecoverable kernel readiness failure.
    pub fn run(&self) {
        let already_running = self.running.swap(true, Ordering::AcqRel);
        assert!(!already_running, "a second thread entered a running reactor");

        let mut timeout = None;
        let mut waiting_for_idle = false;
        let mut events = Vec::new();
        loop {
            let count = self
                .poller
                .wait(&mut events, timeout)
                .unwrap_or_else(|err| panic!("epoll_wait failed: {err}"));

            if waiting_for_idle && count == 0 {
                // Quiescence: a whole readiness call elapsed with nothing to
                // dispatch. Go back to blocking waits and resolve the idle
                // promise.
                timeout = None;
                waiting_for_idle = false;
                let mut registry = self.registry.lock().expect("reactor registry poisoned");
                if let Some(idle) = registry.idle_promise.take() {
                    idle.send(()).ok();
                }
            }

            for (token, io) in events.drain(..) {
                if token == CTRL_TOKEN {
                    let value = self.ctrl.take();
                    if value & CTRL_STOP != 0 {
                        log::debug!(target: "reactor", "Stop command received; \
                            terminating the dispatch loop");
                        self.running.store(false, Ordering::Release);
                        return;
                    } else if value & CTRL_WAIT_FOR_IDLE != 0 {
                        timeout = Some(IDLE_PROBE_TIMEOUT);
                        waiting_for_idle = true;
                    } else if value != 0 {
                        log::error!(target: "reactor", "Unknown control channel value {value:#x}");
                    }
                    // Zero means the wakeup raced with a command which was
                    // already collected by an earlier pass.
                    continue;
                }

                let reactable = {
                    let mut registry = self.registry.lock().expect("reactor registry poisoned");
                    registry.unregister_finished = None;
                    let reactable = match registry.reactables.get(&token) {
                        Some(reactable) => Arc::clone(reactable),
                        // Unregistered after the kernel handed out this
                        // batch; skip the event.
                        None => continue,
                    };
                    // `is_executing` must be raised while the registry lock
                    // is still held: this is what makes `unregister`'s
                    // destroy-now-or-defer decision atomic with respect to
                    // the dispatch.
                    reactable.state.lock().expect("reactable state poisoned").is_executing = true;
                    reactable
                };

                if io.is_readable {
                    if let Some(on_read_ready) = &reactable.on_read_ready {
                        on_read_ready();
                    }
                }
                if io.is_writable {
                    if let Some(on_write_ready) = &reactable.on_write_ready {
                        on_write_ready();
                    }
                }

                let mut state = reactable.state.lock().expect("reactable state poisoned");
                state.is_executing = false;
                if state.removed {
                    if let Some(finished) = state.finished.take() {
                        finished.send(()).ok();
                    }
                    // Dropping `reactable` below destroys the record whose
                    // unregistration was deferred.
                }
            }
        }
    }

    /// Asks the dispatch loop to terminate. Returns immediately without
    /// joining the reactor thread; safe to call from any thread, repeatedly,
    /// and also before [`Reactor::run`] has started (the command is consumed
    /// by the first dispatch pass).
    pub fn stop(&self) {
        if !self.running.load(Ordering::Acquire) {
            log::warn!(target: "reactor", "Reactor is not running; it will stop once started");
        }
        self.ctrl.post(CTRL_STOP);
    }

    /// Blocks the calling thread until the reactor has observed quiescence,
    /// up to `timeout`. Returns whether quiescence was observed in time.
    ///
    /// Quiescence is a heuristic: it is declared when one whole kernel
    /// readiness call returns no events within a short probe timeout. A
    /// reactor whose descriptors fire more often than the probe interval
    /// never reports idle; one with periodic activity may report idle
    /// between events.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let (idle_send, idle_recv) = chan::bounded(1);
        self.registry.lock().expect("reactor registry poisoned").idle_promise = Some(idle_send);
        self.ctrl.post(CTRL_WAIT_FOR_IDLE);
        idle_recv.recv_timeout(timeout).is_ok()
    }

    /// Blocks the calling thread until the most recent deferred
    /// unregistration has completed, up to `timeout`. Returns `true` when
    /// the in-flight callback has returned and the reactable is destroyed -
    /// immediately so when no unregistration is pending.
    ///
    /// After this method returns `true` the callbacks of the unregistered
    /// reactable are guaranteed not to fire again.
    pub fn wait_for_unregistered_reactable(&self, timeout: Duration) -> bool {
        let finished = self
            .registry
            .lock()
            .expect("reactor registry poisoned")
            .unregister_finished
            .clone();
        let finished = match finished {
            Some(finished) => finished,
            None => return true,
        };
        // Waiting happens outside the registry lock; the dispatch loop only
        // needs the reactable's own lock to fire the signal.
        if finished.recv_timeout(timeout).is_err() {
            log::error!(target: "reactor", "Waiting for an unregistered reactable timed out");
            return false;
        }
        true
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        assert!(
            !self.running.load(Ordering::Acquire),
            "reactor dropped while its dispatch loop is still running"
        );
        let registry = self.registry.lock().expect("reactor registry poisoned");
        assert!(
            registry.reactables.is_empty(),
            "reactor dropped with {} live registrations",
            registry.reactables.len()
        );
        self.poller
            .remove(self.ctrl.as_raw_fd())
            .expect("could not remove the control channel from epoll");
    }
}
