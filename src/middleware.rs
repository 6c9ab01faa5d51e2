//! Capability interface of the set-top middleware.
//!
//! The engine never talks to tuners, demuxes or the EPG store directly; it
//! goes through [`Middleware`]. Every call is blocking. A call that never
//! returns stalls whatever invoked it (an aggregation pass included), so
//! implementations are expected to bound their own I/O.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::MiddlewareError;
use crate::filter::Genre;

pub type MwResult<T> = std::result::Result<T, MiddlewareError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendType {
    Sat,
    Cab,
    Ter,
    Ip,
}

impl FrontendType {
    pub const ALL: [FrontendType; 4] = [
        FrontendType::Sat,
        FrontendType::Cab,
        FrontendType::Ter,
        FrontendType::Ip,
    ];

    pub fn is_broadcast(self) -> bool {
        self != FrontendType::Ip
    }
}

impl fmt::Display for FrontendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrontendType::Sat => "SAT",
            FrontendType::Cab => "CAB",
            FrontendType::Ter => "TER",
            FrontendType::Ip => "IP",
        };
        f.write_str(s)
    }
}

impl From<FrontendType> for SourceType {
    fn from(value: FrontendType) -> Self {
        match value {
            FrontendType::Sat => SourceType::Sat,
            FrontendType::Cab => SourceType::Cab,
            FrontendType::Ter => SourceType::Ter,
            FrontendType::Ip => SourceType::Ip,
        }
    }
}

/// Delivery system a service was scanned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sat,
    Cab,
    Ter,
    Ip,
    Analog,
    Undefined,
}

impl SourceType {
    pub fn frontend_type(self) -> Option<FrontendType> {
        match self {
            SourceType::Sat => Some(FrontendType::Sat),
            SourceType::Cab => Some(FrontendType::Cab),
            SourceType::Ter => Some(FrontendType::Ter),
            SourceType::Ip => Some(FrontendType::Ip),
            SourceType::Analog | SourceType::Undefined => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteId(pub u32);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendDescriptor {
    pub id: u32,
    pub types: Vec<FrontendType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxDescriptor {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderDescriptor {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MassStorageDescriptor {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub source: SourceType,
    pub scrambled: bool,
    pub master_index: u32,
}

/// A programme entry as stored by the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgEvent {
    pub event_id: u32,
    pub service_index: usize,
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

/// Kinds of EPG change the middleware reports on a filter handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpgNotification {
    ScheduleChanged,
    ScheduleAcquired,
    PresentFollowingChanged,
    PresentFollowingAcquired,
}

pub type EpgCallback = Arc<dyn Fn(EpgNotification) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRequest {
    pub service_index: usize,
    pub event_id: u32,
    pub name: String,
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderRequest {
    /// Reminder bound to a programme from the guide.
    Event {
        service_index: usize,
        event_id: u32,
        name: String,
        description: String,
        start: NaiveDateTime,
    },
    /// One-shot reminder at a user-chosen time.
    Manual {
        service_index: usize,
        start: NaiveDateTime,
    },
}

pub trait Middleware: Send + Sync {
    // Route control.
    fn frontend_count(&self) -> MwResult<usize>;
    fn frontend_descriptor(&self, index: usize) -> MwResult<FrontendDescriptor>;
    fn demux_descriptor(&self, index: usize) -> MwResult<DemuxDescriptor>;
    fn decoder_descriptor(&self, index: usize) -> MwResult<DecoderDescriptor>;
    fn mass_storage_descriptor(&self, index: usize) -> MwResult<MassStorageDescriptor>;
    fn live_route(&self, frontend_id: u32, demux_id: u32, decoder_id: u32)
        -> MwResult<Option<RouteId>>;
    fn record_route(
        &self,
        frontend_id: u32,
        demux_id: u32,
        mass_storage_id: u32,
    ) -> MwResult<Option<RouteId>>;

    // Service control.
    fn service_count(&self, list_index: usize) -> MwResult<usize>;
    fn service_descriptor(&self, list_index: usize, service_index: usize)
        -> MwResult<ServiceDescriptor>;
    fn start_service(&self, route: RouteId, list_index: usize, service_index: usize)
        -> MwResult<()>;
    fn stop_service(&self, route: RouteId) -> MwResult<()>;
    fn zap_url(&self, route: RouteId, url: &str) -> MwResult<()>;
    fn active_service(&self, route: RouteId) -> MwResult<usize>;

    // EPG control.
    fn create_event_list(&self) -> MwResult<FilterId>;
    fn release_event_list(&self, filter: FilterId) -> MwResult<()>;
    fn set_time_filter(&self, filter: FilterId, begin: NaiveDateTime, end: NaiveDateTime)
        -> MwResult<()>;
    fn set_service_filter(&self, filter: FilterId, service_index: usize) -> MwResult<()>;
    fn set_genre_filter(&self, filter: FilterId, genre: Genre) -> MwResult<()>;
    fn start_acquisition(&self, filter: FilterId) -> MwResult<()>;
    fn stop_acquisition(&self, filter: FilterId) -> MwResult<()>;
    fn available_event_count(&self, filter: FilterId, master_index: u32) -> MwResult<usize>;
    fn event(&self, filter: FilterId, service_index: usize, event_index: usize)
        -> MwResult<EpgEvent>;
    fn register_event_callback(&self, filter: FilterId, callback: EpgCallback)
        -> MwResult<CallbackId>;
    fn unregister_event_callback(&self, filter: FilterId, id: CallbackId) -> MwResult<()>;

    // Setup control.
    fn current_time_date(&self) -> MwResult<NaiveDateTime>;

    // PVR / reminders.
    fn create_smart_record(&self, route: RouteId, request: &RecordRequest) -> MwResult<()>;
    fn create_reminder(&self, request: &ReminderRequest) -> MwResult<()>;
}
