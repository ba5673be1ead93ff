//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Runtime helpers supporting the orchestrator."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::future::{pending, ready};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use futures::future::select_all;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, Signal};
use tracing::{debug, trace, warn};

pub use tokio::signal::unix::SignalKind;

use crate::metrics::DispatchStats;

/// Timer callback. Receives the shared context, the reactor itself and the
/// dispatch time; returns the timer's next deadline.
pub type TimerCallback<C> = Box<dyn FnMut(&mut C, &mut Reactor<C>, Instant) -> Deadline>;

/// Callback for input sources and signals.
pub type ReadyCallback<C> = Box<dyn FnMut(&mut C, &mut Reactor<C>, Instant)>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor is already running")]
    AlreadyRunning,
    #[error("failed to build reactor runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to register file descriptor {fd}: {source}")]
    RegisterFd {
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    RegisterSignal(#[source] std::io::Error),
    #[error("unknown timer {0}")]
    UnknownTimer(TimerHandle),
}

/// When a timer should next fire.
///
/// Variant order is significant: `Now` sorts before every instant and `Never`
/// after every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    Now,
    At(Instant),
    Never,
}

impl Deadline {
    pub fn is_due(&self, now: Instant) -> bool {
        match self {
            Deadline::Now => true,
            Deadline::At(at) => *at <= now,
            Deadline::Never => false,
        }
    }

    fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(at) => Some(*at),
            Deadline::Now | Deadline::Never => None,
        }
    }
}

macro_rules! handle_type {
    ($name:ident, $prefix:literal) => {
        /// Stable identity of a registration; handles are never reused.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(TimerHandle, "timer");
handle_type!(FdHandle, "fd");
handle_type!(SignalHandle, "signal");

struct TimerSlot<C> {
    deadline: Deadline,
    /// `None` while the callback is being dispatched.
    callback: Option<TimerCallback<C>>,
}

/// Descriptor registered for readiness. The caller keeps ownership of the
/// underlying file and must unregister before closing it.
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

enum ReadySource {
    Polled(AsyncFd<WatchedFd>),
    /// Regular files cannot be registered with epoll; like `poll(2)` we treat
    /// them as permanently readable.
    AlwaysReady(RawFd),
}

struct FdSlot<C> {
    source: ReadySource,
    callback: Option<ReadyCallback<C>>,
}

struct SignalSlot<C> {
    signal: Signal,
    callback: Option<ReadyCallback<C>>,
}

enum Wake {
    Deadline,
    Fd(FdHandle),
    Signal(SignalHandle),
}

/// Timer-driven single-threaded event loop.
///
/// Every callback runs on the thread that called [`Reactor::run`], one at a
/// time, with exclusive access to the context `C`. Waiting is delegated to a
/// current-thread tokio runtime so timers, descriptors and signals share one
/// multiplexed wait.
pub struct Reactor<C> {
    epoch: Instant,
    next_id: u64,
    timers: BTreeMap<TimerHandle, TimerSlot<C>>,
    readers: BTreeMap<FdHandle, FdSlot<C>>,
    signals: BTreeMap<SignalHandle, SignalSlot<C>>,
    stopping: bool,
    running: bool,
    dispatch: DispatchStats,
    // Declared last so registrations drop before the driver they belong to.
    runtime: Rc<Runtime>,
}

impl<C> fmt::Debug for Reactor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("timers", &self.timers.len())
            .field("readers", &self.readers.len())
            .field("signals", &self.signals.len())
            .field("running", &self.running)
            .field("stopping", &self.stopping)
            .finish()
    }
}

impl<C> Reactor<C> {
    pub fn new() -> Result<Self, ReactorError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ReactorError::Runtime)?;
        Ok(Self {
            epoch: Instant::now(),
            next_id: 0,
            timers: BTreeMap::new(),
            readers: BTreeMap::new(),
            signals: BTreeMap::new(),
            stopping: false,
            running: false,
            dispatch: DispatchStats::default(),
            runtime: Rc::new(runtime),
        })
    }

    /// Current time on the reactor's monotonic clock.
    pub fn monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Instant the reactor was created; used as the zero of reported times.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn register_timer<F>(&mut self, callback: F, deadline: Deadline) -> TimerHandle
    where
        F: FnMut(&mut C, &mut Reactor<C>, Instant) -> Deadline + 'static,
    {
        let handle = TimerHandle(self.next_id());
        self.timers.insert(
            handle,
            TimerSlot {
                deadline,
                callback: Some(Box::new(callback)),
            },
        );
        trace!(timer = %handle, ?deadline, "timer registered");
        handle
    }

    /// Reschedule a timer. When called on the timer currently being
    /// dispatched, the callback's return value takes precedence.
    pub fn update_timer(
        &mut self,
        handle: TimerHandle,
        deadline: Deadline,
    ) -> Result<(), ReactorError> {
        let slot = self
            .timers
            .get_mut(&handle)
            .ok_or(ReactorError::UnknownTimer(handle))?;
        slot.deadline = deadline;
        Ok(())
    }

    /// Remove a timer for good. Returns `false` if it was already gone.
    /// Calling this from the timer's own callback is allowed.
    pub fn unregister_timer(&mut self, handle: TimerHandle) -> bool {
        let removed = self.timers.remove(&handle).is_some();
        if removed {
            trace!(timer = %handle, "timer unregistered");
        }
        removed
    }

    pub fn timer_deadline(&self, handle: TimerHandle) -> Option<Deadline> {
        self.timers.get(&handle).map(|slot| slot.deadline)
    }

    /// Watch `fd` for readability. The callback must drain the descriptor
    /// until it would block; readiness is re-armed only by new input.
    pub fn register_fd<F>(&mut self, fd: &impl AsRawFd, callback: F) -> Result<FdHandle, ReactorError>
    where
        F: FnMut(&mut C, &mut Reactor<C>, Instant) + 'static,
    {
        let raw = fd.as_raw_fd();
        let source = {
            let _enter = self.runtime.enter();
            match AsyncFd::new(WatchedFd(raw)) {
                Ok(watched) => ReadySource::Polled(watched),
                Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                    debug!(fd = raw, "descriptor does not support readiness; treating as always readable");
                    ReadySource::AlwaysReady(raw)
                }
                Err(source) => return Err(ReactorError::RegisterFd { fd: raw, source }),
            }
        };
        let handle = FdHandle(self.next_id());
        self.readers.insert(
            handle,
            FdSlot {
                source,
                callback: Some(Box::new(callback)),
            },
        );
        trace!(reader = %handle, fd = raw, "descriptor registered");
        Ok(handle)
    }

    /// Stop watching a descriptor. Safe from inside its own callback.
    pub fn unregister_fd(&mut self, handle: FdHandle) -> bool {
        let removed = self.readers.remove(&handle);
        if let Some(slot) = &removed {
            let raw = match &slot.source {
                ReadySource::Polled(watched) => watched.get_ref().0,
                ReadySource::AlwaysReady(raw) => *raw,
            };
            trace!(reader = %handle, fd = raw, "descriptor unregistered");
        }
        removed.is_some()
    }

    /// Dispatch `callback` on the loop whenever the process receives `kind`.
    pub fn register_signal<F>(
        &mut self,
        kind: SignalKind,
        callback: F,
    ) -> Result<SignalHandle, ReactorError>
    where
        F: FnMut(&mut C, &mut Reactor<C>, Instant) + 'static,
    {
        let listener = {
            let _enter = self.runtime.enter();
            signal(kind).map_err(ReactorError::RegisterSignal)?
        };
        let handle = SignalHandle(self.next_id());
        self.signals.insert(
            handle,
            SignalSlot {
                signal: listener,
                callback: Some(Box::new(callback)),
            },
        );
        trace!(signal = %handle, ?kind, "signal listener registered");
        Ok(handle)
    }

    /// Ask the run loop to return once the current callback completes.
    pub fn stop(&mut self) {
        if !self.stopping {
            debug!("reactor stop requested");
        }
        self.stopping = true;
    }

    pub fn dispatch_stats(&self) -> &DispatchStats {
        &self.dispatch
    }

    pub fn stats(&self) -> String {
        let armed = self
            .timers
            .values()
            .filter(|slot| slot.deadline != Deadline::Never)
            .count();
        format!(
            "reactor: timers={} armed={} readers={} {}",
            self.timers.len(),
            armed,
            self.readers.len(),
            self.dispatch.summary()
        )
    }

    /// Run callbacks until [`Reactor::stop`] is called.
    ///
    /// Blocks the calling thread. An empty reactor waits forever rather than
    /// returning.
    pub fn run(&mut self, ctx: &mut C) -> Result<(), ReactorError> {
        if self.running {
            return Err(ReactorError::AlreadyRunning);
        }
        self.running = true;
        self.stopping = false;
        debug!("reactor run loop starting");
        let runtime = Rc::clone(&self.runtime);
        runtime.block_on(self.run_until_stopped(ctx));
        self.running = false;
        debug!(dispatched = self.dispatch.dispatched(), "reactor run loop finished");
        Ok(())
    }

    async fn run_until_stopped(&mut self, ctx: &mut C) {
        while !self.stopping {
            let now = Instant::now();
            if let Some(handle) = self.next_due(now) {
                self.dispatch_timer(handle, ctx, now);
                continue;
            }
            let wake_at = self.next_wake();
            match self.wait(wake_at).await {
                Wake::Deadline => {}
                Wake::Fd(handle) => self.dispatch_fd(handle, ctx),
                Wake::Signal(handle) => self.dispatch_signal(handle, ctx),
            }
        }
    }

    /// Earliest due timer; ties go to the earliest registration.
    fn next_due(&self, now: Instant) -> Option<TimerHandle> {
        self.timers
            .iter()
            .filter(|(_, slot)| slot.callback.is_some() && slot.deadline.is_due(now))
            .min_by(|(a_handle, a), (b_handle, b)| {
                a.deadline.cmp(&b.deadline).then(a_handle.cmp(b_handle))
            })
            .map(|(handle, _)| *handle)
    }

    fn next_wake(&self) -> Option<Instant> {
        self.timers
            .values()
            .filter(|slot| slot.callback.is_some())
            .filter_map(|slot| slot.deadline.instant())
            .min()
    }

    fn dispatch_timer(&mut self, handle: TimerHandle, ctx: &mut C, now: Instant) {
        let Some(slot) = self.timers.get_mut(&handle) else {
            return;
        };
        let Some(mut callback) = slot.callback.take() else {
            return;
        };
        self.dispatch.record(slot.deadline.instant(), now);
        let next = callback(ctx, self, now);
        match self.timers.get_mut(&handle) {
            Some(slot) => {
                slot.deadline = next;
                slot.callback = Some(callback);
            }
            None => trace!(timer = %handle, "timer retired by its own callback"),
        }
    }

    fn dispatch_fd(&mut self, handle: FdHandle, ctx: &mut C) {
        let Some(mut callback) = self
            .readers
            .get_mut(&handle)
            .and_then(|slot| slot.callback.take())
        else {
            return;
        };
        let now = Instant::now();
        callback(ctx, self, now);
        if let Some(slot) = self.readers.get_mut(&handle) {
            slot.callback = Some(callback);
        }
    }

    fn dispatch_signal(&mut self, handle: SignalHandle, ctx: &mut C) {
        let Some(mut callback) = self
            .signals
            .get_mut(&handle)
            .and_then(|slot| slot.callback.take())
        else {
            return;
        };
        debug!(signal = %handle, "signal received");
        let now = Instant::now();
        callback(ctx, self, now);
        if let Some(slot) = self.signals.get_mut(&handle) {
            slot.callback = Some(callback);
        }
    }

    async fn wait(&mut self, wake_at: Option<Instant>) -> Wake {
        let always_ready = self.readers.iter().find_map(|(handle, slot)| {
            match (&slot.source, &slot.callback) {
                (ReadySource::AlwaysReady(_), Some(_)) => Some(*handle),
                _ => None,
            }
        });

        let readers = &self.readers;
        let signals = &mut self.signals;

        let deadline = async {
            match wake_at {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => pending::<()>().await,
            }
        };

        let readable = async {
            let waits: Vec<_> = readers
                .iter()
                .filter(|(_, slot)| slot.callback.is_some())
                .filter_map(|(handle, slot)| match &slot.source {
                    ReadySource::Polled(watched) => Some((*handle, watched)),
                    ReadySource::AlwaysReady(_) => None,
                })
                .map(|(handle, watched)| {
                    Box::pin(async move {
                        match watched.readable().await {
                            Ok(mut guard) => guard.clear_ready(),
                            Err(err) => warn!(reader = %handle, error = %err, "readiness wait failed"),
                        }
                        handle
                    })
                })
                .collect();
            if waits.is_empty() {
                pending::<FdHandle>().await
            } else {
                select_all(waits).await.0
            }
        };

        let signalled = async {
            let waits: Vec<_> = signals
                .iter_mut()
                .filter(|(_, slot)| slot.callback.is_some())
                .map(|(handle, slot)| {
                    let handle = *handle;
                    Box::pin(async move {
                        if slot.signal.recv().await.is_none() {
                            pending::<()>().await;
                        }
                        handle
                    })
                })
                .collect();
            if waits.is_empty() {
                pending::<SignalHandle>().await
            } else {
                select_all(waits).await.0
            }
        };

        if let Some(handle) = always_ready {
            // Let the driver deliver pending signals, then prefer them over
            // the reader so shutdown is not starved by endless input.
            tokio::task::yield_now().await;
            return tokio::select! {
                biased;
                handle = signalled => Wake::Signal(handle),
                _ = ready(()) => Wake::Fd(handle),
            };
        }

        tokio::select! {
            _ = deadline => Wake::Deadline,
            handle = readable => Wake::Fd(handle),
            handle = signalled => Wake::Signal(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn deadline_ordering_places_sentinels_at_the_ends() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert!(Deadline::Now < Deadline::At(now));
        assert!(Deadline::At(now) < Deadline::At(later));
        assert!(Deadline::At(later) < Deadline::Never);
        assert!(Deadline::Now.is_due(now));
        assert!(!Deadline::Never.is_due(later));
        assert!(!Deadline::At(later).is_due(now));
    }

    #[test]
    fn one_shot_timer_stops_the_loop() {
        let mut reactor: Reactor<u32> = Reactor::new().unwrap();
        reactor.register_timer(
            |count: &mut u32, reactor: &mut Reactor<u32>, _| {
                *count += 1;
                reactor.stop();
                Deadline::Never
            },
            Deadline::Now,
        );
        let mut count = 0;
        reactor.run(&mut count).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn nested_run_is_rejected() {
        let mut reactor: Reactor<Option<bool>> = Reactor::new().unwrap();
        reactor.register_timer(
            |seen: &mut Option<bool>, reactor: &mut Reactor<Option<bool>>, _| {
                let mut inner = None;
                *seen = Some(matches!(
                    reactor.run(&mut inner),
                    Err(ReactorError::AlreadyRunning)
                ));
                reactor.stop();
                Deadline::Never
            },
            Deadline::Now,
        );
        let mut seen = None;
        reactor.run(&mut seen).unwrap();
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn update_of_unknown_timer_fails() {
        let mut reactor: Reactor<()> = Reactor::new().unwrap();
        let handle = reactor.register_timer(|_, _, _| Deadline::Never, Deadline::Never);
        assert!(reactor.unregister_timer(handle));
        assert!(!reactor.unregister_timer(handle));
        assert!(matches!(
            reactor.update_timer(handle, Deadline::Now),
            Err(ReactorError::UnknownTimer(_))
        ));
    }
}
