//! EPG timeline aggregation.
//!
//! A pass reads every broadcast service's events for one day through a
//! single middleware filter handle and buckets them into a
//! [`TimeSlotGrid`]. At most one pass runs at a time; the finished grid is
//! swapped in whole, so readers never see a half-built one.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::channels::ChannelResolver;
use crate::error::Result;
use crate::filter::{DayDelta, FilterState, Genre};
use crate::grid::{DayBucketer, TimeSlotGrid};
use crate::guard::{LoadGuard, LoadPermit};
use crate::metrics::{self, EPG_GRID_EVENTS};
use crate::middleware::{EpgEvent, FilterId, Middleware};

/// Formats a date the way the guide header shows it: `d/m/yyyy`.
pub fn format_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

/// Time window requested for one guide day. Starting at 00:01:01 keeps
/// events that end exactly at midnight out of the day.
pub fn day_window(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let begin = date.and_time(NaiveTime::from_hms_opt(0, 1, 1).unwrap_or(NaiveTime::MIN));
    let end = (date + Days::new(1)).and_time(NaiveTime::MIN);
    (begin, end)
}

/// Owned middleware filter handle.
pub struct EventList {
    middleware: Arc<dyn Middleware>,
    id: FilterId,
}

impl EventList {
    pub fn create(middleware: Arc<dyn Middleware>) -> Result<Self> {
        let id = middleware.create_event_list()?;
        debug!("Created EPG filter {:?}", id);
        Ok(Self { middleware, id })
    }

    pub fn id(&self) -> FilterId {
        self.id
    }

    pub fn set_time_window(&self, begin: NaiveDateTime, end: NaiveDateTime) -> Result<()> {
        self.middleware.set_time_filter(self.id, begin, end)?;
        Ok(())
    }

    pub fn set_genre(&self, genre: Genre) -> Result<()> {
        self.middleware.set_genre_filter(self.id, genre)?;
        Ok(())
    }

    /// Narrows the filter to one service and starts acquisition on it.
    pub fn acquire(&self, service_index: usize) -> Result<Acquisition<'_>> {
        self.middleware.set_service_filter(self.id, service_index)?;
        self.middleware.start_acquisition(self.id)?;
        Ok(Acquisition {
            list: self,
            service_index,
            active: true,
        })
    }
}

impl Drop for EventList {
    fn drop(&mut self) {
        if let Err(e) = self.middleware.release_event_list(self.id) {
            warn!("Failed to release EPG filter {:?}: {}", self.id, e);
        }
    }
}

/// A running acquisition on one service. Stopped by [`finish`](Self::finish)
/// or, on early exit, when dropped.
pub struct Acquisition<'a> {
    list: &'a EventList,
    service_index: usize,
    active: bool,
}

impl Acquisition<'_> {
    pub fn count(&self, master_index: u32) -> Result<usize> {
        Ok(self
            .list
            .middleware
            .available_event_count(self.list.id, master_index)?)
    }

    pub fn event(&self, event_index: usize) -> Result<EpgEvent> {
        Ok(self
            .list
            .middleware
            .event(self.list.id, self.service_index, event_index)?)
    }

    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.list.middleware.stop_acquisition(self.list.id)?;
        Ok(())
    }
}

impl Drop for Acquisition<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.list.middleware.stop_acquisition(self.list.id) {
                warn!(
                    "Failed to stop acquisition on service {}: {}",
                    self.service_index, e
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFinished {
    /// `d/m/yyyy` of the loaded day.
    pub date: String,
    pub day_offset: u32,
    pub events: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailed {
    pub day_offset: u32,
    pub error: String,
}

/// Sent once for every pass that got past the load guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadEvent {
    Finished(LoadFinished),
    Failed(LoadFailed),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Completed(LoadFinished),
    /// Another pass was running; nothing was done.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpgState {
    pub day_offset: u32,
    pub max_days: u32,
    pub genre: Genre,
    pub loading: bool,
    pub date: Option<String>,
    /// Error of the most recent pass, cleared by the next successful one.
    pub last_error: Option<String>,
}

pub struct EpgAggregator {
    middleware: Arc<dyn Middleware>,
    resolver: Arc<ChannelResolver>,
    events: Mutex<EventList>,
    filters: Mutex<FilterState>,
    guard: LoadGuard,
    grid_tx: watch::Sender<Arc<TimeSlotGrid>>,
    finished_tx: broadcast::Sender<LoadEvent>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EpgAggregator {
    pub fn new(
        middleware: Arc<dyn Middleware>,
        resolver: Arc<ChannelResolver>,
        max_days: u32,
    ) -> Result<Self> {
        let events = EventList::create(middleware.clone())?;
        let (grid_tx, _) = watch::channel(Arc::new(TimeSlotGrid::default()));
        let (finished_tx, _) = broadcast::channel(16);
        Ok(Self {
            middleware,
            resolver,
            events: Mutex::new(events),
            filters: Mutex::new(FilterState::new(max_days)),
            guard: LoadGuard::new(),
            grid_tx,
            finished_tx,
            last_error: Mutex::new(None),
        })
    }

    pub fn filter_id(&self) -> FilterId {
        lock(&self.events).id()
    }

    /// Most recently published grid. Never waits for a running pass.
    pub fn grid(&self) -> Arc<TimeSlotGrid> {
        self.grid_tx.borrow().clone()
    }

    pub fn subscribe_grid(&self) -> watch::Receiver<Arc<TimeSlotGrid>> {
        self.grid_tx.subscribe()
    }

    /// Every pass that runs ends with exactly one event, successful or not.
    pub fn subscribe_finished(&self) -> broadcast::Receiver<LoadEvent> {
        self.finished_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.guard.is_running()
    }

    pub fn state(&self) -> EpgState {
        let filters = lock(&self.filters);
        EpgState {
            day_offset: filters.day_offset(),
            max_days: filters.max_days(),
            genre: filters.genre(),
            loading: self.guard.is_running(),
            date: self.grid().date.map(format_date),
            last_error: lock(&self.last_error).clone(),
        }
    }

    /// Stores the genre and installs it on the filter handle right away.
    /// Does not reload; waits for a running pass to let go of the handle.
    pub fn set_genre_filter(&self, genre: Genre) -> Result<()> {
        lock(&self.filters).set_genre(genre);
        lock(&self.events).set_genre(genre)?;
        info!("EPG genre filter set to {:?}", genre);
        Ok(())
    }

    /// Runs a pass on the calling thread, or drops the request if one is
    /// already running.
    pub fn trigger_load(&self, delta: DayDelta) -> Result<LoadStatus> {
        match self.guard.try_enter() {
            Some(permit) => self.load_with(permit, delta).map(LoadStatus::Completed),
            None => {
                self.dropped(delta);
                Ok(LoadStatus::Dropped)
            }
        }
    }

    /// Claims the guard on the calling thread and runs the pass on the
    /// runtime's blocking pool. Returns false when the request was dropped.
    pub fn spawn_load(self: &Arc<Self>, handle: &Handle, delta: DayDelta) -> bool {
        let Some(permit) = self.guard.try_enter() else {
            self.dropped(delta);
            return false;
        };
        let this = Arc::clone(self);
        handle.spawn_blocking(move || {
            // The outcome reaches callers through `subscribe_finished`.
            let _ = this.load_with(permit, delta);
        });
        true
    }

    fn dropped(&self, delta: DayDelta) {
        info!("EPG load already running, dropping {:?} request", delta);
        metrics::record_pass("dropped");
    }

    fn load_with(&self, permit: LoadPermit, delta: DayDelta) -> Result<LoadFinished> {
        match self.build_grid(delta) {
            Ok(grid) => {
                let finished = LoadFinished {
                    date: grid.date.map(format_date).unwrap_or_default(),
                    day_offset: grid.day_offset,
                    events: grid.event_count(),
                };
                *lock(&self.last_error) = None;
                permit.leave();
                EPG_GRID_EVENTS.set(finished.events as i64);
                self.grid_tx.send_replace(Arc::new(grid));
                // No subscribers is fine.
                let _ = self.finished_tx.send(LoadEvent::Finished(finished.clone()));
                metrics::record_pass("completed");
                info!(
                    "EPG load finished for {} ({} entries)",
                    finished.date, finished.events
                );
                Ok(finished)
            }
            Err(e) => {
                let failed = LoadFailed {
                    day_offset: lock(&self.filters).day_offset(),
                    error: e.to_string(),
                };
                *lock(&self.last_error) = Some(failed.error.clone());
                drop(permit);
                metrics::record_pass("failed");
                error!("EPG load aborted, keeping previous grid: {}", e);
                let _ = self.finished_tx.send(LoadEvent::Failed(failed));
                Err(e)
            }
        }
    }

    fn build_grid(&self, delta: DayDelta) -> Result<TimeSlotGrid> {
        let (day_offset, genre) = {
            let mut filters = lock(&self.filters);
            let offset = filters.apply(delta);
            (offset, filters.genre())
        };

        let today = self.middleware.current_time_date()?.date();
        let date = today + Days::new(u64::from(day_offset));
        let (begin, end) = day_window(date);
        let layout = self.resolver.layout()?;
        let list_index = self.resolver.list_index();
        info!(
            "EPG load started for {} (offset {}, {} broadcast channels)",
            format_date(date),
            day_offset,
            layout.broadcast_count
        );

        let events = lock(&self.events);
        events.set_genre(genre)?;
        events.set_time_window(begin, end)?;

        let mut grid = TimeSlotGrid::for_day(layout.logical_count(), date, day_offset);
        let mut bucketer = DayBucketer::new();

        // IP channels carry no EPG.
        for logical in 0..layout.broadcast_count {
            let physical = layout.broadcast_physical(logical);
            let descriptor = self.middleware.service_descriptor(list_index, physical)?;
            let acquisition = events.acquire(physical)?;
            let count = acquisition.count(descriptor.master_index)?;
            debug!(
                "Service {} ({}) has {} events",
                physical, descriptor.name, count
            );
            for index in 0..count {
                let event = acquisition.event(index)?;
                bucketer.place(&mut grid, logical, &event);
            }
            acquisition.finish()?;
        }

        Ok(grid)
    }
}
