//! Single-threaded event dispatcher
//!
//! One thread owns the poller and runs every callback. All mutation of the
//! listener set, from any thread including the dispatch thread itself, goes
//! through a cloneable [`DispatcherHandle`] which enqueues a control message
//! and wakes the poller:
//!
//! ```text
//!   any thread                          dispatch thread
//!   ----------                          ---------------
//!   handle.add_io_listener()    --+
//!   handle.add_timer_listener() --+-->  control queue
//!   handle.stop()               --+          |
//!                 waker.wake()  ------>  poll wakeup, one message
//!                                        applied per iteration
//! ```
//!
//! Each [`EventDispatcher::dispatch_next_event`] call runs five steps in
//! order: fire due timers, wait for I/O readiness, apply one control
//! message, invoke I/O callbacks, invoke process listeners. It returns
//! `Ok(false)` once a stop request has been read and `Ok(true)` otherwise,
//! so a run loop is `while dispatcher.dispatch_next_event(ctx)? {}`.
//!
//! Every callback returns a bool: `true` means "remove this listener now",
//! which is the only way to mutate the listener set synchronously. Anything
//! else (adding listeners from inside a callback, removing some other
//! listener) goes through a handle and takes effect on a later iteration.
//!
//! The poller is edge-triggered. An I/O callback must keep reading or
//! writing until the descriptor returns `WouldBlock`, or it will not hear
//! about the remaining data.

mod timer;

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timer::TimerQueue;

/// Token reserved for the wakeup channel; listener keys start at 1
const WAKER_TOKEN: Token = Token(0);

bitflags::bitflags! {
    /// I/O conditions a listener can wait for
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Out-of-band or priority data
        const EXCEPTION = 1 << 2;
    }
}

/// Identifies one registered listener of any kind.
///
/// Keys are unique across I/O, timer and process listeners for the lifetime
/// of the dispatcher, so a key never aliases a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(pub(crate) u64);

/// I/O listener callback. Receives the events that were both requested and
/// reported; returns true to remove the listener.
pub type IoCallback<C> = Box<dyn FnMut(&mut C, ListenerKey, RawFd, IoEvents) -> bool + Send>;

/// Timer callback. Returns true to cancel the timer.
pub type TimerCallback<C> = Box<dyn FnMut(&mut C, ListenerKey) -> bool + Send>;

/// Process listener callback, run once per dispatch iteration. Returns true
/// to remove the listener.
pub type ProcessCallback<C> = Box<dyn FnMut(&mut C, ListenerKey) -> bool + Send>;

enum ControlMessage<C> {
    AddIo {
        key: ListenerKey,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback<C>,
    },
    RemoveIo {
        key: ListenerKey,
    },
    AddTimer {
        key: ListenerKey,
        first_fire: Instant,
        interval: Duration,
        callback: TimerCallback<C>,
    },
    RemoveTimer {
        key: ListenerKey,
    },
    AddProcess {
        key: ListenerKey,
        callback: ProcessCallback<C>,
    },
    RemoveProcess {
        key: ListenerKey,
    },
    Interrupt,
    Stop,
}

/// Thread-safe front end to a running [`EventDispatcher`].
///
/// Handles can be cloned freely and sent to other threads. Every method
/// enqueues a control message and wakes the dispatch thread; the change is
/// applied between dispatch iterations, never reentrantly.
pub struct DispatcherHandle<C> {
    tx: Sender<ControlMessage<C>>,
    waker: Arc<Waker>,
    next_key: Arc<AtomicU64>,
}

// Not derived: that would demand C: Clone for no reason.
impl<C> Clone for DispatcherHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
            next_key: Arc::clone(&self.next_key),
        }
    }
}

impl<C> DispatcherHandle<C> {
    fn allocate_key(&self) -> ListenerKey {
        ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, message: ControlMessage<C>) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::DispatcherGone)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Register an I/O listener for `fd`. The listener key is returned
    /// immediately; the registration takes effect on the next iteration.
    ///
    /// One listener per descriptor. A registration for a descriptor that
    /// already has one, or that the poller rejects, is dropped with an
    /// error log naming the returned key; that key then never matches a
    /// live listener and removing it is a no-op.
    pub fn add_io_listener(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback<C>,
    ) -> Result<ListenerKey> {
        if events.is_empty() {
            return Err(Error::InvalidParameter(
                "I/O listener requires a non-empty event mask".to_string(),
            ));
        }
        let key = self.allocate_key();
        self.send(ControlMessage::AddIo {
            key,
            fd,
            events,
            callback,
        })?;
        Ok(key)
    }

    /// Register a timer that first fires at `first_fire` and then every
    /// `interval` until its callback returns true. A zero interval makes it
    /// one-shot.
    pub fn add_timer_listener(
        &self,
        first_fire: Instant,
        interval: Duration,
        callback: TimerCallback<C>,
    ) -> Result<ListenerKey> {
        let key = self.allocate_key();
        self.send(ControlMessage::AddTimer {
            key,
            first_fire,
            interval,
            callback,
        })?;
        Ok(key)
    }

    /// Register a listener invoked once at the end of every dispatch
    /// iteration.
    pub fn add_process_listener(&self, callback: ProcessCallback<C>) -> Result<ListenerKey> {
        let key = self.allocate_key();
        self.send(ControlMessage::AddProcess { key, callback })?;
        Ok(key)
    }

    pub fn remove_io_listener(&self, key: ListenerKey) -> Result<()> {
        self.send(ControlMessage::RemoveIo { key })
    }

    pub fn remove_timer_listener(&self, key: ListenerKey) -> Result<()> {
        self.send(ControlMessage::RemoveTimer { key })
    }

    pub fn remove_process_listener(&self, key: ListenerKey) -> Result<()> {
        self.send(ControlMessage::RemoveProcess { key })
    }

    /// Wake the dispatch thread without doing anything else. The woken
    /// iteration still runs its process listeners.
    pub fn interrupt(&self) -> Result<()> {
        self.send(ControlMessage::Interrupt)
    }

    /// Ask the dispatcher to shut down. Queued messages ahead of the stop
    /// request are still applied, one per iteration, before it is read.
    pub fn stop(&self) -> Result<()> {
        self.send(ControlMessage::Stop)
    }
}

struct IoListener<C> {
    key: ListenerKey,
    fd: RawFd,
    events: IoEvents,
    callback: IoCallback<C>,
}

struct ProcessListener<C> {
    key: ListenerKey,
    callback: ProcessCallback<C>,
}

/// The reactor. `C` is the dispatch context handed to every callback,
/// typically the application state the callbacks need to mutate.
pub struct EventDispatcher<C> {
    poll: Poll,
    events: Events,
    rx: Receiver<ControlMessage<C>>,
    handle: DispatcherHandle<C>,
    io_listeners: Vec<IoListener<C>>,
    timers: TimerQueue<C>,
    process_listeners: Vec<ProcessListener<C>>,
    /// Set after a bad-descriptor poll failure; cleared once a control
    /// message arrives and re-registration succeeds
    recovering: bool,
    stopped: bool,
}

impl<C> EventDispatcher<C> {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = DispatcherHandle {
            tx,
            waker: Arc::new(waker),
            next_key: Arc::new(AtomicU64::new(1)),
        };
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            rx,
            handle,
            io_listeners: Vec::new(),
            timers: TimerQueue::new(),
            process_listeners: Vec::new(),
            recovering: false,
            stopped: false,
        })
    }

    /// A handle for registering listeners, from this thread or any other.
    pub fn handle(&self) -> DispatcherHandle<C> {
        self.handle.clone()
    }

    pub fn add_io_listener(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback<C>,
    ) -> Result<ListenerKey> {
        self.handle.add_io_listener(fd, events, callback)
    }

    pub fn add_timer_listener(
        &self,
        first_fire: Instant,
        interval: Duration,
        callback: TimerCallback<C>,
    ) -> Result<ListenerKey> {
        self.handle.add_timer_listener(first_fire, interval, callback)
    }

    pub fn add_process_listener(&self, callback: ProcessCallback<C>) -> Result<ListenerKey> {
        self.handle.add_process_listener(callback)
    }

    pub fn remove_io_listener(&self, key: ListenerKey) -> Result<()> {
        self.handle.remove_io_listener(key)
    }

    pub fn remove_timer_listener(&self, key: ListenerKey) -> Result<()> {
        self.handle.remove_timer_listener(key)
    }

    pub fn remove_process_listener(&self, key: ListenerKey) -> Result<()> {
        self.handle.remove_process_listener(key)
    }

    pub fn interrupt(&self) -> Result<()> {
        self.handle.interrupt()
    }

    pub fn stop(&self) -> Result<()> {
        self.handle.stop()
    }

    /// Run one dispatch iteration, blocking until at least one event source
    /// is ready. Returns `Ok(false)` once a stop request has been read;
    /// every later call returns `Ok(false)` without blocking.
    pub fn dispatch_next_event(&mut self, ctx: &mut C) -> Result<bool> {
        if self.stopped {
            return Ok(false);
        }

        // Step 1: fire every timer that is already due.
        let fired_timers = self.timers.fire_due(ctx, Instant::now());

        // Step 2: wait for readiness. The wait collapses to a zero timeout
        // when work is already pending, so timer callbacks and queued control
        // messages cannot be starved by a quiet descriptor set.
        loop {
            let timeout = self.poll_timeout(fired_timers);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
                    log::warn!("Event wait failed on a closed descriptor, entering recovery");
                    self.enter_recovery();
                    self.events.clear();
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut ready: HashMap<ListenerKey, IoEvents> = HashMap::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let key = ListenerKey(event.token().0 as u64);
            *ready.entry(key).or_insert(IoEvents::empty()) |= ready_events(event);
        }

        // Step 3: apply at most one queued control message. Applying them
        // one at a time keeps a burst of registrations from delaying the
        // event sources that are already ready.
        if let Ok(message) = self.rx.try_recv() {
            let was_recovering = self.recovering;
            self.apply_control(message);
            if self.stopped {
                return Ok(false);
            }
            if was_recovering {
                self.leave_recovery();
            }
        }

        // Step 4: invoke I/O callbacks in registration order.
        if !self.recovering && !ready.is_empty() {
            let poll = &self.poll;
            self.io_listeners.retain_mut(|listener| {
                let Some(&reported) = ready.get(&listener.key) else {
                    return true;
                };
                // Deliver only what was asked for. If the report is outside
                // the requested mask (a hangup on a write-only socket, say),
                // deliver the requested mask so the listener trips over the
                // error on its next operation.
                let mut deliver = reported & listener.events;
                if deliver.is_empty() {
                    deliver = listener.events;
                }
                if (listener.callback)(ctx, listener.key, listener.fd, deliver) {
                    if let Err(err) = poll.registry().deregister(&mut SourceFd(&listener.fd)) {
                        log::debug!("Deregistering fd {} failed: {}", listener.fd, err);
                    }
                    false
                } else {
                    true
                }
            });
        }

        // Step 5: run process listeners.
        self.process_listeners
            .retain_mut(|listener| !(listener.callback)(ctx, listener.key));

        Ok(true)
    }

    /// Dispatch until [`stop`](DispatcherHandle::stop) is requested.
    pub fn dispatch_events(&mut self, ctx: &mut C) -> Result<()> {
        while self.dispatch_next_event(ctx)? {}
        Ok(())
    }

    fn poll_timeout(&mut self, fired_timers: usize) -> Option<Duration> {
        if fired_timers > 0 || !self.rx.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn apply_control(&mut self, message: ControlMessage<C>) {
        match message {
            ControlMessage::AddIo {
                key,
                fd,
                events,
                callback,
            } => self.register_io(key, fd, events, callback),
            ControlMessage::RemoveIo { key } => {
                if let Some(index) = self.io_listeners.iter().position(|l| l.key == key) {
                    let listener = self.io_listeners.remove(index);
                    if let Err(err) = self
                        .poll
                        .registry()
                        .deregister(&mut SourceFd(&listener.fd))
                    {
                        log::debug!("Deregistering fd {} failed: {}", listener.fd, err);
                    }
                } else {
                    log::debug!("Remove for unknown I/O listener {:?}", key);
                }
            }
            ControlMessage::AddTimer {
                key,
                first_fire,
                interval,
                callback,
            } => self.timers.insert(key, first_fire, interval, callback),
            ControlMessage::RemoveTimer { key } => self.timers.cancel(key),
            ControlMessage::AddProcess { key, callback } => {
                self.process_listeners.push(ProcessListener { key, callback });
            }
            ControlMessage::RemoveProcess { key } => {
                if let Some(index) = self.process_listeners.iter().position(|l| l.key == key) {
                    self.process_listeners.remove(index);
                } else {
                    log::debug!("Remove for unknown process listener {:?}", key);
                }
            }
            ControlMessage::Interrupt => {}
            ControlMessage::Stop => {
                log::debug!("Stop request received");
                self.stopped = true;
            }
        }
    }

    fn register_io(
        &mut self,
        key: ListenerKey,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback<C>,
    ) {
        if self.io_listeners.iter().any(|l| l.fd == fd) {
            log::error!("fd {} already has an I/O listener, dropping {:?}", fd, key);
            return;
        }
        let token = Token(key.0 as usize);
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest_for(events))
        {
            log::error!(
                "Registering fd {} as {:?} with the poller failed: {}",
                fd,
                key,
                err
            );
            return;
        }
        self.io_listeners.push(IoListener {
            key,
            fd,
            events,
            callback,
        });
    }

    /// Drop every descriptor from the poller so the next wait only watches
    /// the wakeup channel. Deregistration failures are expected, one of the
    /// descriptors is already gone.
    fn enter_recovery(&mut self) {
        self.recovering = true;
        for listener in &self.io_listeners {
            let _ = self.poll.registry().deregister(&mut SourceFd(&listener.fd));
        }
    }

    /// Put every surviving listener back. Called after a control message has
    /// been applied, which is the earliest point the stale registration can
    /// have been removed.
    fn leave_recovery(&mut self) {
        self.recovering = false;
        let mut failed = false;
        for listener in &self.io_listeners {
            let token = Token(listener.key.0 as usize);
            if let Err(err) = self.poll.registry().register(
                &mut SourceFd(&listener.fd),
                token,
                interest_for(listener.events),
            ) {
                log::error!("Re-registering fd {} failed: {}", listener.fd, err);
                failed = true;
            }
        }
        if failed {
            log::warn!("Recovery incomplete, waiting for another control message");
            self.enter_recovery();
        } else {
            log::info!(
                "Recovered from closed descriptor, {} listeners re-registered",
                self.io_listeners.len()
            );
        }
    }
}

fn interest_for(events: IoEvents) -> Interest {
    let mut interest: Option<Interest> = None;
    if events.contains(IoEvents::READ) {
        interest = Some(Interest::READABLE);
    }
    if events.contains(IoEvents::WRITE) {
        interest = Some(match interest {
            Some(existing) => existing | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    if events.contains(IoEvents::EXCEPTION) {
        interest = Some(match interest {
            Some(existing) => existing | Interest::PRIORITY,
            None => Interest::PRIORITY,
        });
    }
    // Callers validate against an empty mask before this is reached.
    interest.unwrap_or(Interest::READABLE)
}

fn ready_events(event: &mio::event::Event) -> IoEvents {
    let mut ready = IoEvents::empty();
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        ready |= IoEvents::READ;
    }
    if event.is_writable() || event.is_write_closed() {
        ready |= IoEvents::WRITE;
    }
    if event.is_priority() {
        ready |= IoEvents::EXCEPTION;
    }
    ready
}
