//! In-process middleware backed by a static fixture.
//!
//! Used by the demo binary when no real set-top middleware is attached, and
//! by the test-suite. Service list 0 is the only list. The most recent
//! capability calls are kept in a bounded journal so callers can check what
//! a request touched.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{Local, NaiveDateTime, Timelike};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::MiddlewareError;
use crate::filter::Genre;
use crate::middleware::{
    CallbackId, DecoderDescriptor, DemuxDescriptor, EpgCallback, EpgEvent, EpgNotification,
    FilterId, FrontendDescriptor, FrontendType, MassStorageDescriptor, Middleware, MwResult,
    RecordRequest, ReminderRequest, RouteId, ServiceDescriptor, SourceType,
};

/// Journal entries kept before the oldest are discarded.
pub const JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    /// Fixed wall clock. Falls back to local time when absent.
    #[serde(default)]
    pub now: Option<NaiveDateTime>,
    #[serde(default)]
    pub frontends: Vec<FixtureFrontend>,
    #[serde(default)]
    pub services: Vec<FixtureService>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFrontend {
    pub id: u32,
    pub types: Vec<FrontendType>,
    /// When false the middleware refuses to build routes for this frontend.
    #[serde(default = "default_routable")]
    pub routable: bool,
}

fn default_routable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureService {
    pub name: String,
    #[serde(default = "default_source")]
    pub source: SourceType,
    #[serde(default)]
    pub scrambled: bool,
    #[serde(default)]
    pub master_index: Option<u32>,
    #[serde(default)]
    pub events: Vec<FixtureEvent>,
}

fn default_source() -> SourceType {
    SourceType::Undefined
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureEvent {
    #[serde(default)]
    pub event_id: Option<u32>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default)]
    pub parental_rating: u8,
    #[serde(default)]
    pub genre: u8,
}

impl Fixture {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: Some(now),
            ..Self::default()
        }
    }

    pub fn frontend(mut self, id: u32, types: &[FrontendType]) -> Self {
        self.frontends.push(FixtureFrontend {
            id,
            types: types.to_vec(),
            routable: true,
        });
        self
    }

    pub fn service(mut self, name: &str, source: SourceType) -> Self {
        self.services.push(FixtureService {
            name: name.to_string(),
            source,
            scrambled: false,
            master_index: None,
            events: Vec::new(),
        });
        self
    }

    pub fn scrambled_service(mut self, name: &str, source: SourceType) -> Self {
        self = self.service(name, source);
        if let Some(last) = self.services.last_mut() {
            last.scrambled = true;
        }
        self
    }

    /// Adds an event to the most recently added service.
    pub fn event(mut self, name: &str, start: NaiveDateTime, end: NaiveDateTime, genre: u8) -> Self {
        if let Some(last) = self.services.last_mut() {
            last.events.push(FixtureEvent {
                event_id: None,
                name: name.to_string(),
                description: String::new(),
                start,
                end,
                parental_rating: 0,
                genre,
            });
        }
        self
    }

    fn epg_event(&self, service_index: usize, event_index: usize) -> Option<EpgEvent> {
        let service = self.services.get(service_index)?;
        let ev = service.events.get(event_index)?;
        Some(EpgEvent {
            event_id: ev
                .event_id
                .unwrap_or((service_index * 1000 + event_index) as u32),
            service_index,
            name: ev.name.clone(),
            description: ev.description.clone(),
            start: ev.start,
            end: ev.end,
            parental_rating: ev.parental_rating,
            genre: ev.genre,
        })
    }

    fn master_index(&self, service_index: usize) -> Option<u32> {
        let service = self.services.get(service_index)?;
        Some(service.master_index.unwrap_or(service_index as u32))
    }
}

#[derive(Debug, Default)]
struct SimFilter {
    window: Option<(NaiveDateTime, NaiveDateTime)>,
    service: Option<usize>,
    genre: Genre,
    acquiring: bool,
}

#[derive(Default)]
struct SimState {
    next_filter: u32,
    filters: HashMap<FilterId, SimFilter>,
    next_callback: u64,
    callbacks: Vec<(CallbackId, FilterId, EpgCallback)>,
    active: HashMap<RouteId, usize>,
    zapped: HashMap<RouteId, String>,
    records: Vec<(RouteId, RecordRequest)>,
    reminders: Vec<ReminderRequest>,
    journal: VecDeque<String>,
    failing_service: Option<usize>,
    offline: bool,
}

pub struct SimulatedMiddleware {
    fixture: Fixture,
    state: Mutex<SimState>,
}

fn unavailable(operation: &'static str, reason: impl Into<String>) -> MiddlewareError {
    MiddlewareError::new(operation, reason)
}

impl SimulatedMiddleware {
    pub fn new(fixture: Fixture) -> Self {
        Self {
            fixture,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let fixture: Fixture = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;
        info!(
            "Loaded middleware fixture {}: {} frontends, {} services",
            path,
            fixture.frontends.len(),
            fixture.services.len()
        );
        Ok(Self::new(fixture))
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    /// Capability calls since the last [`clear_calls`](Self::clear_calls),
    /// oldest first. Only the last [`JOURNAL_CAPACITY`] are kept.
    pub fn calls(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.journal.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut s) = self.lock() {
            s.journal.clear();
        }
    }

    /// Makes the service filter for `service_index` fail from now on.
    pub fn fail_service(&self, service_index: Option<usize>) {
        if let Ok(mut s) = self.lock() {
            s.failing_service = service_index;
        }
    }

    /// Simulates a lost connection: every call fails while set.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut s) = self.lock() {
            s.offline = offline;
        }
    }

    pub fn zapped_url(&self, route: RouteId) -> Option<String> {
        self.lock().ok().and_then(|s| s.zapped.get(&route).cloned())
    }

    pub fn records(&self) -> Vec<(RouteId, RecordRequest)> {
        self.lock().map(|s| s.records.clone()).unwrap_or_default()
    }

    pub fn reminders(&self) -> Vec<ReminderRequest> {
        self.lock().map(|s| s.reminders.clone()).unwrap_or_default()
    }

    pub fn has_callbacks(&self) -> bool {
        self.lock().map(|s| !s.callbacks.is_empty()).unwrap_or(false)
    }

    /// Fires every registered EPG callback on the calling thread.
    pub fn notify_epg_changed(&self, notification: EpgNotification) {
        let callbacks: Vec<EpgCallback> = match self.lock() {
            Ok(s) => s.callbacks.iter().map(|(_, _, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        debug!("Dispatching {:?} to {} callbacks", notification, callbacks.len());
        for cb in callbacks {
            cb(notification);
        }
    }

    fn lock(&self) -> MwResult<std::sync::MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| unavailable("lock", "simulated middleware state poisoned"))
    }

    /// Locks state, journals the call and fails when offline.
    fn enter(&self, operation: &'static str, entry: String) -> MwResult<std::sync::MutexGuard<'_, SimState>> {
        let mut s = self.lock()?;
        if s.journal.len() == JOURNAL_CAPACITY {
            s.journal.pop_front();
        }
        s.journal.push_back(entry);
        if s.offline {
            return Err(unavailable(operation, "middleware offline"));
        }
        Ok(s)
    }

    /// Route ids are `base + 10 * slot + endpoint`, where slot is the
    /// frontend's position in the fixture. Unroutable frontends and ids that
    /// do not fit get no route.
    fn route_id(&self, base: u32, frontend_id: u32, endpoint: u32) -> Option<RouteId> {
        let slot = self
            .fixture
            .frontends
            .iter()
            .position(|f| f.id == frontend_id && f.routable)?;
        let slot = u32::try_from(slot).ok()?;
        base.checked_add(slot.checked_mul(10)?)?
            .checked_add(endpoint)
            .map(RouteId)
    }

    fn filtered_events(&self, filter: &SimFilter, service_index: usize) -> Vec<EpgEvent> {
        let Some(service) = self.fixture.services.get(service_index) else {
            return Vec::new();
        };
        let mut events: Vec<EpgEvent> = (0..service.events.len())
            .filter_map(|i| self.fixture.epg_event(service_index, i))
            .filter(|ev| match filter.window {
                Some((begin, end)) => ev.end > begin && ev.start < end,
                None => true,
            })
            .filter(|ev| filter.genre.matches(ev.genre))
            .collect();
        events.sort_by_key(|ev| ev.start);
        events
    }
}

fn acquiring_filter<'a>(
    s: &'a SimState,
    operation: &'static str,
    filter: FilterId,
) -> MwResult<&'a SimFilter> {
    let f = s
        .filters
        .get(&filter)
        .ok_or_else(|| unavailable(operation, format!("unknown filter {}", filter.0)))?;
    if !f.acquiring {
        return Err(unavailable(operation, "acquisition not started"));
    }
    Ok(f)
}

impl Middleware for SimulatedMiddleware {
    fn frontend_count(&self) -> MwResult<usize> {
        let _s = self.enter("frontend_count", "frontend_count".into())?;
        Ok(self.fixture.frontends.len())
    }

    fn frontend_descriptor(&self, index: usize) -> MwResult<FrontendDescriptor> {
        let _s = self.enter("frontend_descriptor", format!("frontend_descriptor({index})"))?;
        self.fixture
            .frontends
            .get(index)
            .map(|f| FrontendDescriptor {
                id: f.id,
                types: f.types.clone(),
            })
            .ok_or_else(|| unavailable("frontend_descriptor", format!("no frontend {index}")))
    }

    fn demux_descriptor(&self, index: usize) -> MwResult<DemuxDescriptor> {
        let _s = self.enter("demux_descriptor", format!("demux_descriptor({index})"))?;
        match index {
            0 => Ok(DemuxDescriptor { id: 0 }),
            _ => Err(unavailable("demux_descriptor", format!("no demux {index}"))),
        }
    }

    fn decoder_descriptor(&self, index: usize) -> MwResult<DecoderDescriptor> {
        let _s = self.enter("decoder_descriptor", format!("decoder_descriptor({index})"))?;
        match index {
            0 => Ok(DecoderDescriptor { id: 0 }),
            _ => Err(unavailable("decoder_descriptor", format!("no decoder {index}"))),
        }
    }

    fn mass_storage_descriptor(&self, index: usize) -> MwResult<MassStorageDescriptor> {
        let _s = self.enter(
            "mass_storage_descriptor",
            format!("mass_storage_descriptor({index})"),
        )?;
        match index {
            0 => Ok(MassStorageDescriptor { id: 0 }),
            _ => Err(unavailable(
                "mass_storage_descriptor",
                format!("no mass storage {index}"),
            )),
        }
    }

    fn live_route(&self, frontend_id: u32, demux_id: u32, decoder_id: u32) -> MwResult<Option<RouteId>> {
        let _s = self.enter(
            "live_route",
            format!("live_route({frontend_id},{demux_id},{decoder_id})"),
        )?;
        Ok(self.route_id(100, frontend_id, decoder_id))
    }

    fn record_route(&self, frontend_id: u32, demux_id: u32, mass_storage_id: u32) -> MwResult<Option<RouteId>> {
        let _s = self.enter(
            "record_route",
            format!("record_route({frontend_id},{demux_id},{mass_storage_id})"),
        )?;
        Ok(self.route_id(200, frontend_id, mass_storage_id))
    }

    fn service_count(&self, list_index: usize) -> MwResult<usize> {
        let _s = self.enter("service_count", format!("service_count({list_index})"))?;
        if list_index != 0 {
            return Err(unavailable("service_count", format!("no service list {list_index}")));
        }
        Ok(self.fixture.services.len())
    }

    fn service_descriptor(&self, list_index: usize, service_index: usize) -> MwResult<ServiceDescriptor> {
        let _s = self.enter(
            "service_descriptor",
            format!("service_descriptor({list_index},{service_index})"),
        )?;
        if list_index != 0 {
            return Err(unavailable("service_descriptor", format!("no service list {list_index}")));
        }
        let service = self.fixture.services.get(service_index).ok_or_else(|| {
            unavailable("service_descriptor", format!("no service {service_index}"))
        })?;
        Ok(ServiceDescriptor {
            name: service.name.clone(),
            source: service.source,
            scrambled: service.scrambled,
            master_index: self.fixture.master_index(service_index).unwrap_or(0),
        })
    }

    fn start_service(&self, route: RouteId, list_index: usize, service_index: usize) -> MwResult<()> {
        let mut s = self.enter(
            "start_service",
            format!("start_service({},{list_index},{service_index})", route.0),
        )?;
        if service_index >= self.fixture.services.len() {
            return Err(unavailable("start_service", format!("no service {service_index}")));
        }
        s.zapped.remove(&route);
        s.active.insert(route, service_index);
        Ok(())
    }

    fn stop_service(&self, route: RouteId) -> MwResult<()> {
        let mut s = self.enter("stop_service", format!("stop_service({})", route.0))?;
        s.active.remove(&route);
        s.zapped.remove(&route);
        Ok(())
    }

    fn zap_url(&self, route: RouteId, url: &str) -> MwResult<()> {
        let mut s = self.enter("zap_url", format!("zap_url({},{url})", route.0))?;
        s.active.remove(&route);
        s.zapped.insert(route, url.to_string());
        Ok(())
    }

    fn active_service(&self, route: RouteId) -> MwResult<usize> {
        let s = self.enter("active_service", format!("active_service({})", route.0))?;
        s.active
            .get(&route)
            .copied()
            .ok_or_else(|| unavailable("active_service", format!("nothing playing on {route}")))
    }

    fn create_event_list(&self) -> MwResult<FilterId> {
        let mut s = self.enter("create_event_list", "create_event_list".into())?;
        let id = FilterId(s.next_filter);
        s.next_filter += 1;
        s.filters.insert(id, SimFilter::default());
        Ok(id)
    }

    fn release_event_list(&self, filter: FilterId) -> MwResult<()> {
        let mut s = self.enter("release_event_list", format!("release_event_list({})", filter.0))?;
        s.filters
            .remove(&filter)
            .map(|_| ())
            .ok_or_else(|| unavailable("release_event_list", format!("unknown filter {}", filter.0)))
    }

    fn set_time_filter(&self, filter: FilterId, begin: NaiveDateTime, end: NaiveDateTime) -> MwResult<()> {
        let mut s = self.enter(
            "set_time_filter",
            format!("set_time_filter({},{begin},{end})", filter.0),
        )?;
        let f = s
            .filters
            .get_mut(&filter)
            .ok_or_else(|| unavailable("set_time_filter", format!("unknown filter {}", filter.0)))?;
        f.window = Some((begin, end));
        Ok(())
    }

    fn set_service_filter(&self, filter: FilterId, service_index: usize) -> MwResult<()> {
        let mut s = self.enter(
            "set_service_filter",
            format!("set_service_filter({},{service_index})", filter.0),
        )?;
        if s.failing_service == Some(service_index) {
            return Err(unavailable(
                "set_service_filter",
                format!("service {service_index} unreachable"),
            ));
        }
        let f = s.filters.get_mut(&filter).ok_or_else(|| {
            unavailable("set_service_filter", format!("unknown filter {}", filter.0))
        })?;
        f.service = Some(service_index);
        Ok(())
    }

    fn set_genre_filter(&self, filter: FilterId, genre: Genre) -> MwResult<()> {
        let mut s = self.enter(
            "set_genre_filter",
            format!("set_genre_filter({},{genre:?})", filter.0),
        )?;
        let f = s
            .filters
            .get_mut(&filter)
            .ok_or_else(|| unavailable("set_genre_filter", format!("unknown filter {}", filter.0)))?;
        f.genre = genre;
        Ok(())
    }

    fn start_acquisition(&self, filter: FilterId) -> MwResult<()> {
        let mut s = self.enter("start_acquisition", format!("start_acquisition({})", filter.0))?;
        let f = s.filters.get_mut(&filter).ok_or_else(|| {
            unavailable("start_acquisition", format!("unknown filter {}", filter.0))
        })?;
        f.acquiring = true;
        Ok(())
    }

    fn stop_acquisition(&self, filter: FilterId) -> MwResult<()> {
        let mut s = self.enter("stop_acquisition", format!("stop_acquisition({})", filter.0))?;
        let f = s.filters.get_mut(&filter).ok_or_else(|| {
            unavailable("stop_acquisition", format!("unknown filter {}", filter.0))
        })?;
        f.acquiring = false;
        Ok(())
    }

    fn available_event_count(&self, filter: FilterId, master_index: u32) -> MwResult<usize> {
        let s = self.enter(
            "available_event_count",
            format!("available_event_count({},{master_index})", filter.0),
        )?;
        let f = acquiring_filter(&s, "available_event_count", filter)?;
        let service_index = (0..self.fixture.services.len())
            .find(|&i| self.fixture.master_index(i) == Some(master_index));
        Ok(service_index
            .map(|i| self.filtered_events(f, i).len())
            .unwrap_or(0))
    }

    fn event(&self, filter: FilterId, service_index: usize, event_index: usize) -> MwResult<EpgEvent> {
        let s = self.enter(
            "event",
            format!("event({},{service_index},{event_index})", filter.0),
        )?;
        let f = acquiring_filter(&s, "event", filter)?;
        self.filtered_events(f, service_index)
            .into_iter()
            .nth(event_index)
            .ok_or_else(|| {
                unavailable(
                    "event",
                    format!("no event {event_index} on service {service_index}"),
                )
            })
    }

    fn register_event_callback(&self, filter: FilterId, callback: EpgCallback) -> MwResult<CallbackId> {
        let mut s = self.enter(
            "register_event_callback",
            format!("register_event_callback({})", filter.0),
        )?;
        let id = CallbackId(s.next_callback);
        s.next_callback += 1;
        s.callbacks.push((id, filter, callback));
        Ok(id)
    }

    fn unregister_event_callback(&self, filter: FilterId, id: CallbackId) -> MwResult<()> {
        let mut s = self.enter(
            "unregister_event_callback",
            format!("unregister_event_callback({},{})", filter.0, id.0),
        )?;
        s.callbacks.retain(|(cid, fid, _)| !(*cid == id && *fid == filter));
        Ok(())
    }

    fn current_time_date(&self) -> MwResult<NaiveDateTime> {
        let _s = self.enter("current_time_date", "current_time_date".into())?;
        let now = self.fixture.now.unwrap_or_else(|| Local::now().naive_local());
        Ok(now.with_nanosecond(0).unwrap_or(now))
    }

    fn create_smart_record(&self, route: RouteId, request: &RecordRequest) -> MwResult<()> {
        let mut s = self.enter(
            "create_smart_record",
            format!("create_smart_record({},{})", route.0, request.event_id),
        )?;
        s.records.push((route, request.clone()));
        Ok(())
    }

    fn create_reminder(&self, request: &ReminderRequest) -> MwResult<()> {
        let mut s = self.enter("create_reminder", "create_reminder".into())?;
        s.reminders.push(request.clone());
        Ok(())
    }
}
