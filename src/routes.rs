use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::middleware::{FrontendType, Middleware, RouteId, SourceType};

/// Demux, decoder and mass-storage descriptors are always taken at index 0.
const DESCRIPTOR_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub live: Option<RouteId>,
    pub record: Option<RouteId>,
}

/// Live and record routes per frontend type, resolved once at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteTable {
    entries: HashMap<FrontendType, RouteEntry>,
    mixed_ip_and_broadcast: bool,
}

impl RouteTable {
    /// Walks every frontend and claims a route for each type it offers.
    /// The first frontend offering a type wins.
    pub fn build(middleware: &dyn Middleware) -> Result<Self> {
        let demux = middleware.demux_descriptor(DESCRIPTOR_INDEX)?;
        let decoder = middleware.decoder_descriptor(DESCRIPTOR_INDEX)?;
        let storage = middleware.mass_storage_descriptor(DESCRIPTOR_INDEX)?;
        let frontends = middleware.frontend_count()?;

        let mut entries: HashMap<FrontendType, RouteEntry> = HashMap::new();
        for index in 0..frontends {
            let frontend = middleware.frontend_descriptor(index)?;
            for frontend_type in frontend.types {
                let entry = entries.entry(frontend_type).or_default();
                if entry.live.is_some() {
                    debug!(
                        "Frontend {} also offers {}, keeping earlier route",
                        frontend.id, frontend_type
                    );
                    continue;
                }
                entry.live = middleware.live_route(frontend.id, demux.id, decoder.id)?;
                if entry.record.is_none() {
                    entry.record = middleware.record_route(frontend.id, demux.id, storage.id)?;
                }
                match entry.live {
                    Some(route) => info!(
                        "Frontend {} claims {} (live={} record={:?})",
                        frontend.id, frontend_type, route, entry.record
                    ),
                    None => warn!(
                        "Frontend {} offers {} but the middleware built no live route",
                        frontend.id, frontend_type
                    ),
                }
            }
        }

        if frontends == 0 {
            warn!("Middleware reports no frontends; every tune will fail with no route");
        }

        let has_ip = entries
            .get(&FrontendType::Ip)
            .is_some_and(|e| e.live.is_some());
        let has_broadcast = FrontendType::ALL
            .iter()
            .filter(|t| t.is_broadcast())
            .any(|t| entries.get(t).is_some_and(|e| e.live.is_some()));

        Ok(Self {
            entries,
            mixed_ip_and_broadcast: has_ip && has_broadcast,
        })
    }

    /// `None` is the unset sentinel; callers must not tune with it.
    pub fn live_route(&self, frontend_type: FrontendType) -> Option<RouteId> {
        self.entries.get(&frontend_type).and_then(|e| e.live)
    }

    pub fn record_route(&self, frontend_type: FrontendType) -> Option<RouteId> {
        self.entries.get(&frontend_type).and_then(|e| e.record)
    }

    pub fn require_live(&self, frontend_type: FrontendType) -> Result<RouteId> {
        self.live_route(frontend_type)
            .ok_or(EngineError::NoRoute(frontend_type.into()))
    }

    /// Live route for a service of the given source. Sources without a
    /// delivery system (analog, undefined) never have one.
    pub fn live_route_for(&self, source: SourceType) -> Result<RouteId> {
        source
            .frontend_type()
            .and_then(|t| self.live_route(t))
            .ok_or(EngineError::NoRoute(source))
    }

    pub fn record_route_for(&self, source: SourceType) -> Result<RouteId> {
        source
            .frontend_type()
            .and_then(|t| self.record_route(t))
            .ok_or(EngineError::NoRoute(source))
    }

    pub fn has_ip(&self) -> bool {
        self.live_route(FrontendType::Ip).is_some()
    }

    pub fn has_broadcast(&self) -> bool {
        FrontendType::ALL
            .iter()
            .filter(|t| t.is_broadcast())
            .any(|t| self.live_route(*t).is_some())
    }

    /// True when both an IP route and a broadcast route exist; the broadcast
    /// list then starts with a dummy entry.
    pub fn is_mixed(&self) -> bool {
        self.mixed_ip_and_broadcast
    }
}
