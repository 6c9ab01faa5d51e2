use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::channels::{ChannelInfo, ChannelResolver, ServiceKind};
use crate::error::{EngineError, Result};
use crate::grid::BucketedEvent;
use crate::metrics;
use crate::middleware::{
    FrontendType, Middleware, RecordRequest, ReminderRequest, RouteId, SourceType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TuneOutcome {
    Tuned { channel: ChannelInfo },
    /// No route for the channel's delivery system; nothing was tuned.
    NoRoute {
        channel: ChannelInfo,
        source: SourceType,
    },
}

impl TuneOutcome {
    pub fn channel(&self) -> &ChannelInfo {
        match self {
            TuneOutcome::Tuned { channel } | TuneOutcome::NoRoute { channel, .. } => channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TunerNotice {
    Scrambled { channel: ChannelInfo },
}

#[derive(Debug, Clone, Default)]
struct TunerState {
    current_route: Option<RouteId>,
    current_kind: Option<ServiceKind>,
    current_ip_channel: Option<usize>,
    last_watched: Option<usize>,
}

/// Channel change and playback control.
pub struct Tuner {
    middleware: Arc<dyn Middleware>,
    resolver: Arc<ChannelResolver>,
    state: Mutex<TunerState>,
    notices: broadcast::Sender<TunerNotice>,
}

impl Tuner {
    pub fn new(middleware: Arc<dyn Middleware>, resolver: Arc<ChannelResolver>) -> Self {
        let (notices, _) = broadcast::channel(16);
        Self {
            middleware,
            resolver,
            state: Mutex::new(TunerState::default()),
            notices,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<TunerNotice> {
        self.notices.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, TunerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts playback, typically of the last watched channel.
    pub fn start(&self, logical: usize) -> Result<TuneOutcome> {
        info!("Starting playback on channel {}", logical + 1);
        let mut state = self.lock();
        self.tune(&mut state, logical)
    }

    pub fn change_channel_by_number(&self, logical: usize) -> Result<TuneOutcome> {
        let mut state = self.lock();
        self.tune(&mut state, logical)
    }

    pub fn change_channel_up(&self) -> Result<TuneOutcome> {
        let mut state = self.lock();
        let count = self.non_empty_count()?;
        let target = match self.current_number(&state)? {
            Some(current) => (current + 1) % count,
            None => 0,
        };
        self.tune(&mut state, target)
    }

    pub fn change_channel_down(&self) -> Result<TuneOutcome> {
        let mut state = self.lock();
        let count = self.non_empty_count()?;
        let target = match self.current_number(&state)? {
            Some(current) => (current % count + count - 1) % count,
            None => count - 1,
        };
        self.tune(&mut state, target)
    }

    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(route) = state.current_route {
            self.middleware.stop_service(route)?;
            info!("Stopped playback on {}", route);
        }
        state.current_route = None;
        state.current_kind = None;
        state.current_ip_channel = None;
        Ok(())
    }

    /// Logical index of what is playing, `None` when nothing is.
    pub fn current_channel_number(&self) -> Result<Option<usize>> {
        let state = self.lock();
        self.current_number(&state)
    }

    pub fn last_watched(&self) -> Option<usize> {
        self.lock().last_watched
    }

    pub fn current_route(&self) -> Option<RouteId> {
        self.lock().current_route
    }

    fn non_empty_count(&self) -> Result<usize> {
        match self.resolver.logical_count()? {
            0 => Err(EngineError::OutOfRange { index: 0, count: 0 }),
            n => Ok(n),
        }
    }

    fn current_number(&self, state: &TunerState) -> Result<Option<usize>> {
        match (state.current_kind, state.current_route) {
            (Some(ServiceKind::Ip), _) => Ok(state.current_ip_channel),
            (Some(ServiceKind::Broadcast), Some(route)) => {
                let physical = self.middleware.active_service(route)?;
                let layout = self.resolver.layout()?;
                Ok(layout.broadcast_logical(physical))
            }
            _ => Ok(None),
        }
    }

    fn tune(&self, state: &mut TunerState, logical: usize) -> Result<TuneOutcome> {
        let outcome = self.tune_inner(state, logical);
        match &outcome {
            Ok(TuneOutcome::Tuned { .. }) => metrics::record_tune("tuned"),
            Ok(TuneOutcome::NoRoute { .. }) => metrics::record_tune("no_route"),
            Err(e) => {
                warn!("Tune to channel {} failed: {}", logical + 1, e);
                metrics::record_tune("failed");
            }
        }
        outcome
    }

    fn tune_inner(&self, state: &mut TunerState, logical: usize) -> Result<TuneOutcome> {
        let resolved = self.resolver.resolve_channel(logical)?;
        let channel = resolved.info.clone();

        let route = match resolved.kind {
            ServiceKind::Broadcast => {
                if resolved.scrambled {
                    // Nobody listening is fine.
                    let _ = self.notices.send(TunerNotice::Scrambled {
                        channel: channel.clone(),
                    });
                }
                let Ok(route) = self.resolver.routes().live_route_for(resolved.source) else {
                    warn!("No live route for {} ({:?})", channel.name, resolved.source);
                    return Ok(TuneOutcome::NoRoute {
                        channel,
                        source: resolved.source,
                    });
                };
                self.middleware.start_service(
                    route,
                    self.resolver.list_index(),
                    resolved.physical_index,
                )?;
                state.current_ip_channel = None;
                route
            }
            ServiceKind::Ip => {
                let Some(route) = self.resolver.routes().live_route(FrontendType::Ip) else {
                    warn!("No IP route for {}", channel.name);
                    return Ok(TuneOutcome::NoRoute {
                        channel,
                        source: SourceType::Ip,
                    });
                };
                let url = resolved.url.as_deref().unwrap_or_default();
                self.middleware.zap_url(route, url)?;
                state.current_ip_channel = Some(logical);
                route
            }
        };

        state.current_route = Some(route);
        state.current_kind = Some(resolved.kind);
        state.last_watched = Some(logical);
        info!("Tuned to {} {} on {}", channel.number, channel.name, route);
        Ok(TuneOutcome::Tuned { channel })
    }

    /// Schedules a recording of the programme behind a guide entry.
    pub fn schedule_recording(&self, entry: &BucketedEvent) -> Result<()> {
        let event = &entry.source;
        let descriptor = self
            .middleware
            .service_descriptor(self.resolver.list_index(), event.service_index)?;
        let route = self.resolver.routes().record_route_for(descriptor.source)?;
        let request = RecordRequest {
            service_index: event.service_index,
            event_id: event.event_id,
            name: event.name.clone(),
            description: event.description.clone(),
            start: event.start,
            end: event.end,
        };
        self.middleware.create_smart_record(route, &request)?;
        info!("Recording scheduled: {} at {}", event.name, event.start);
        Ok(())
    }

    pub fn schedule_reminder(&self, entry: &BucketedEvent) -> Result<()> {
        let event = &entry.source;
        self.middleware.create_reminder(&ReminderRequest::Event {
            service_index: event.service_index,
            event_id: event.event_id,
            name: event.name.clone(),
            description: event.description.clone(),
            start: event.start,
        })?;
        info!("Reminder set: {} at {}", event.name, event.start);
        Ok(())
    }

    /// One-shot reminder on a broadcast channel at a chosen time.
    pub fn schedule_manual_reminder(&self, logical: usize, start: NaiveDateTime) -> Result<()> {
        let layout = self.resolver.layout()?;
        if logical >= layout.broadcast_count {
            return Err(EngineError::OutOfRange {
                index: logical,
                count: layout.broadcast_count,
            });
        }
        self.middleware.create_reminder(&ReminderRequest::Manual {
            service_index: layout.broadcast_physical(logical),
            start,
        })?;
        info!("Manual reminder set on channel {} at {}", logical + 1, start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{IpChannel, IpChannelList};
    use crate::grid::{DayBucketer, TimeSlotGrid};
    use crate::middleware::EpgEvent;
    use crate::routes::RouteTable;
    use crate::simulated::{Fixture, SimulatedMiddleware};
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn setup(fixture: Fixture, ip: usize) -> (Arc<SimulatedMiddleware>, Tuner) {
        let sim = Arc::new(SimulatedMiddleware::new(fixture));
        let mw: Arc<dyn Middleware> = sim.clone();
        let routes = Arc::new(RouteTable::build(mw.as_ref()).unwrap());
        let ip_channels = IpChannelList::new(
            (0..ip)
                .map(|i| IpChannel {
                    name: format!("Web {i}"),
                    url: format!("http://stream/{i}"),
                })
                .collect(),
        );
        let resolver = Arc::new(ChannelResolver::new(mw.clone(), routes, ip_channels, 0));
        sim.clear_calls();
        (sim, Tuner::new(mw, resolver))
    }

    fn mixed() -> Fixture {
        Fixture::at(t(12, 0))
            .frontend(0, &[FrontendType::Cab])
            .frontend(1, &[FrontendType::Ip])
            .service("DUMMY", SourceType::Undefined)
            .service("Das Erste", SourceType::Cab)
            .scrambled_service("Sky", SourceType::Cab)
            .service("Radio", SourceType::Sat)
    }

    #[test]
    fn test_broadcast_tune_starts_physical_service() {
        let (sim, tuner) = setup(mixed(), 2);
        let outcome = tuner.change_channel_by_number(0).unwrap();
        assert_eq!(
            outcome,
            TuneOutcome::Tuned {
                channel: ChannelInfo { number: 1, name: "Das Erste".into() }
            }
        );
        assert!(sim.calls().contains(&"start_service(100,0,1)".to_string()));
        assert_eq!(tuner.current_channel_number().unwrap(), Some(0));
        assert_eq!(tuner.last_watched(), Some(0));
    }

    #[test]
    fn test_ip_tune_zaps_url() {
        let (sim, tuner) = setup(mixed(), 2);
        // 3 broadcast channels, then the IP list.
        let outcome = tuner.change_channel_by_number(4).unwrap();
        assert_eq!(outcome.channel().name, "Web 1");
        assert_eq!(sim.zapped_url(RouteId(110)).as_deref(), Some("http://stream/1"));
        assert_eq!(tuner.current_channel_number().unwrap(), Some(4));
    }

    #[test]
    fn test_scrambled_channel_publishes_notice() {
        let (_sim, tuner) = setup(mixed(), 0);
        let mut notices = tuner.subscribe_notices();
        tuner.change_channel_by_number(1).unwrap();
        assert_eq!(
            notices.try_recv().unwrap(),
            TunerNotice::Scrambled {
                channel: ChannelInfo { number: 2, name: "Sky".into() }
            }
        );
    }

    #[test]
    fn test_missing_route_is_a_no_op() {
        let (sim, tuner) = setup(mixed(), 0);
        // "Radio" is a SAT service; only CAB and IP have routes.
        let outcome = tuner.change_channel_by_number(2).unwrap();
        assert_eq!(
            outcome,
            TuneOutcome::NoRoute {
                channel: ChannelInfo { number: 3, name: "Radio".into() },
                source: SourceType::Sat,
            }
        );
        assert!(!sim.calls().iter().any(|c| c.starts_with("start_service")));
        assert_eq!(tuner.current_route(), None);
        assert_eq!(tuner.last_watched(), None);
    }

    #[test]
    fn test_no_frontends_means_every_tune_has_no_route() {
        let (sim, tuner) = setup(
            Fixture::at(t(12, 0)).service("Lonely", SourceType::Ter),
            0,
        );
        assert!(matches!(
            tuner.start(0).unwrap(),
            TuneOutcome::NoRoute { source: SourceType::Ter, .. }
        ));
        assert!(!sim.calls().iter().any(|c| c.starts_with("start_service")));
    }

    #[test]
    fn test_out_of_range_is_rejected_before_middleware_calls() {
        let (sim, tuner) = setup(mixed(), 1);
        assert_eq!(
            tuner.change_channel_by_number(4),
            Err(EngineError::OutOfRange { index: 4, count: 4 })
        );
        assert!(!sim
            .calls()
            .iter()
            .any(|c| c.starts_with("start_service") || c.starts_with("zap_url")));
    }

    #[test]
    fn test_up_and_down_wrap() {
        let (_sim, tuner) = setup(mixed(), 1);
        // Nothing tuned: up goes to the first channel, down to the last.
        assert_eq!(tuner.change_channel_down().unwrap().channel().number, 4);
        assert_eq!(tuner.change_channel_up().unwrap().channel().number, 1);
        assert_eq!(tuner.change_channel_down().unwrap().channel().number, 4);
        assert_eq!(tuner.change_channel_down().unwrap().channel().number, 3);
    }

    #[test]
    fn test_up_on_empty_list_is_out_of_range() {
        let (_sim, tuner) = setup(Fixture::at(t(12, 0)).frontend(0, &[FrontendType::Ip]), 0);
        assert_eq!(
            tuner.change_channel_up(),
            Err(EngineError::OutOfRange { index: 0, count: 0 })
        );
    }

    #[test]
    fn test_stop_releases_current_route() {
        let (sim, tuner) = setup(mixed(), 0);
        tuner.start(0).unwrap();
        tuner.stop().unwrap();
        assert!(sim.calls().contains(&"stop_service(100)".to_string()));
        assert_eq!(tuner.current_channel_number().unwrap(), None);
        assert_eq!(tuner.last_watched(), Some(0));
    }

    fn guide_entry(service_index: usize) -> BucketedEvent {
        let mut grid = TimeSlotGrid::new(1);
        let event = EpgEvent {
            event_id: 42,
            service_index,
            name: "Tatort".into(),
            description: "Crime".into(),
            start: t(20, 15),
            end: t(21, 45),
            parental_rating: 0,
            genre: 0x1,
        };
        DayBucketer::new().place(&mut grid, 0, &event);
        grid.events(20, 0)[0].clone()
    }

    #[test]
    fn test_recording_uses_record_route_and_original_event() {
        let (sim, tuner) = setup(mixed(), 0);
        tuner.schedule_recording(&guide_entry(1)).unwrap();
        let records = sim.records();
        assert_eq!(records.len(), 1);
        let (route, request) = &records[0];
        assert_eq!(*route, RouteId(200));
        assert_eq!(request.event_id, 42);
        // The original end, not the clipped one.
        assert_eq!(request.end, t(21, 45));
    }

    #[test]
    fn test_recording_without_record_route_fails() {
        let (_sim, tuner) = setup(mixed(), 0);
        assert_eq!(
            tuner.schedule_recording(&guide_entry(3)),
            Err(EngineError::NoRoute(SourceType::Sat))
        );
    }

    #[test]
    fn test_reminders() {
        let (sim, tuner) = setup(mixed(), 1);
        tuner.schedule_reminder(&guide_entry(1)).unwrap();
        tuner.schedule_manual_reminder(1, t(22, 0)).unwrap();
        assert_eq!(
            tuner.schedule_manual_reminder(3, t(22, 0)),
            Err(EngineError::OutOfRange { index: 3, count: 3 })
        );

        let reminders = sim.reminders();
        assert_eq!(reminders.len(), 2);
        assert!(matches!(
            &reminders[0],
            ReminderRequest::Event { event_id: 42, service_index: 1, .. }
        ));
        assert_eq!(
            reminders[1],
            ReminderRequest::Manual { service_index: 2, start: t(22, 0) }
        );
    }
}
