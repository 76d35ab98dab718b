//! Per-path quiet-period coalescing of raw watch events.
//!
//! Every event restarts the path's timer. When a timer expires the path is
//! handed to exactly one worker, carrying the last observed kind. While that
//! dispatch is in flight, new events for the same path are held until
//! [`DebounceQueue::complete`] is called, so a path never has two
//! registrations running at once.
//!
//! A `MovedTo` origin survives later `Created`/`Modified` events on the same
//! destination so the move is not lost when an editor touches the file right
//! after renaming it. On [`DebounceQueue::close`] every pending timer fires
//! immediately.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};
use tracing::trace;

use crate::model::{WatchEvent, WatchEventKind};

/// A path whose quiet period elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    /// Number of raw events folded into this dispatch.
    pub events: u32,
}

#[derive(Debug)]
struct Pending {
    kind: WatchEventKind,
    deadline: Instant,
    events: u32,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<PathBuf, Pending>,
    in_flight: HashSet<PathBuf>,
    closed: bool,
}

enum Next {
    Ready(Dispatch),
    WaitUntil(Instant),
    Idle,
    Drained,
}

impl State {
    fn record(&mut self, event: WatchEvent, deadline: Instant) {
        let WatchEvent { path, kind, .. } = event;

        let (kind, events) = match self.pending.remove(&path) {
            Some(previous) => {
                let merged = match (previous.kind, kind) {
                    (
                        WatchEventKind::MovedTo { from },
                        WatchEventKind::Created | WatchEventKind::Modified,
                    ) => WatchEventKind::MovedTo { from },
                    (WatchEventKind::MovedTo { from }, removal)
                        if removal.is_removal() =>
                    {
                        // The moved file vanished before we saw it settle;
                        // its origin record must go too, unless the origin
                        // already has newer events of its own.
                        if !self.pending.contains_key(&from) {
                            self.schedule(from, WatchEventKind::Deleted, deadline, 1);
                        }
                        removal
                    }
                    (_, latest) => latest,
                };
                (merged, previous.events.saturating_add(1))
            }
            None => (kind, 1),
        };

        self.schedule(path, kind, deadline, events);
    }

    fn schedule(
        &mut self,
        path: PathBuf,
        kind: WatchEventKind,
        deadline: Instant,
        events: u32,
    ) {
        self.pending.insert(
            path,
            Pending {
                kind,
                deadline,
                events,
            },
        );
    }

    fn take_ready(&mut self, now: Instant) -> Next {
        let mut earliest_ready: Option<(&PathBuf, Instant)> = None;
        let mut earliest_wait: Option<Instant> = None;

        for (path, pending) in &self.pending {
            if self.in_flight.contains(path) {
                continue;
            }
            if self.closed || pending.deadline <= now {
                if earliest_ready.is_none_or(|(_, at)| pending.deadline < at) {
                    earliest_ready = Some((path, pending.deadline));
                }
            } else if earliest_wait.is_none_or(|at| pending.deadline < at) {
                earliest_wait = Some(pending.deadline);
            }
        }

        if let Some((path, _)) = earliest_ready {
            let path = path.clone();
            if let Some(pending) = self.pending.remove(&path) {
                self.in_flight.insert(path.clone());
                return Next::Ready(Dispatch {
                    path,
                    kind: pending.kind,
                    events: pending.events,
                });
            }
        }

        match earliest_wait {
            Some(at) => Next::WaitUntil(at),
            None if self.closed && self.pending.is_empty() => Next::Drained,
            None => Next::Idle,
        }
    }
}

/// Internally synchronized debounce queue shared by the watcher, the
/// scanner and all workers.
#[derive(Debug)]
pub struct DebounceQueue {
    quiet_period: Duration,
    state: Mutex<State>,
    notify: Notify,
}

impl DebounceQueue {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Records an event and restarts the path's quiet period.
    pub fn push(&self, event: WatchEvent) {
        let deadline = event.observed_at.max(Instant::now()) + self.quiet_period;
        trace!(path = %event.path.display(), kind = event.kind.label(), "debounce push");
        self.state.lock().record(event, deadline);
        self.notify.notify_waiters();
    }

    /// Returns a dispatch whose quiet period has elapsed, without waiting.
    pub fn try_next_ready(&self) -> Option<Dispatch> {
        match self.state.lock().take_ready(Instant::now()) {
            Next::Ready(dispatch) => Some(dispatch),
            _ => None,
        }
    }

    /// Waits for the next ready dispatch. Returns `None` once the queue is
    /// closed and nothing is left pending.
    ///
    /// Cancel safe: state only changes in the step that returns a dispatch.
    pub async fn next_ready(&self) -> Option<Dispatch> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.state.lock().take_ready(Instant::now());
            match next {
                Next::Ready(dispatch) => return Some(dispatch),
                Next::Drained => return None,
                Next::WaitUntil(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(at) => {}
                    }
                }
                Next::Idle => notified.await,
            }
        }
    }

    /// Marks the dispatch for `path` finished, releasing any events that
    /// arrived while it ran.
    pub fn complete(&self, path: &std::path::Path) {
        self.state.lock().in_flight.remove(path);
        self.notify.notify_waiters();
    }

    /// Stops waiting on timers: everything pending becomes ready now.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed with nothing pending.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
