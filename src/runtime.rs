use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::controller::SessionController;
use crate::store::KeyValueStorage;
use crate::sync::{CompletionSync, SyncEvent};

/// Source of wall-clock time for timestamps and durations.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for Rc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Configurable ticker interface
pub trait Ticker {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Polls a [`CompletionSync`] once per tick and feeds its events to the controller
/// until nothing is in flight and no clear is pending.
pub struct Runner<T: Ticker> {
    ticker: T,
}

impl<T: Ticker> Runner<T> {
    pub fn new(ticker: T) -> Self {
        Self { ticker }
    }

    /// Handle at most one sync event. Returns it after the controller has applied it.
    pub fn step<S, C>(
        &self,
        controller: &mut SessionController<S, C>,
        sync: &mut CompletionSync,
    ) -> Option<SyncEvent>
    where
        S: KeyValueStorage,
        C: Clock,
    {
        let event = sync.poll(controller.now())?;
        controller.apply_sync_event(&event);
        Some(event)
    }

    pub fn run_until_settled<S, C, F>(
        &self,
        controller: &mut SessionController<S, C>,
        sync: &mut CompletionSync,
        mut on_event: F,
    ) where
        S: KeyValueStorage,
        C: Clock,
        F: FnMut(&SyncEvent),
    {
        while !sync.is_idle() {
            match self.step(controller, sync) {
                Some(event) => on_event(&event),
                None => std::thread::sleep(self.ticker.interval()),
            }
        }
    }
}
