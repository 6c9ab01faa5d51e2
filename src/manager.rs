use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::channels::{ChannelResolver, IpChannelList};
use crate::epg::{format_date, EpgAggregator};
use crate::error::Result;
use crate::filter::{DayDelta, MAX_EPG_DAYS};
use crate::middleware::{CallbackId, EpgCallback, Middleware};
use crate::routes::RouteTable;
use crate::tuner::Tuner;

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Middleware service list holding the broadcast channels.
    #[serde(default)]
    pub list_index: usize,
    #[serde(default = "default_max_days")]
    pub max_days: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            list_index: 0,
            max_days: default_max_days(),
        }
    }
}

fn default_max_days() -> u32 {
    MAX_EPG_DAYS
}

/// Owns every engine component. Built once at startup and shared by handle.
pub struct DvbManager {
    middleware: Arc<dyn Middleware>,
    routes: Arc<RouteTable>,
    resolver: Arc<ChannelResolver>,
    tuner: Tuner,
    epg: Arc<EpgAggregator>,
    callback: Mutex<Option<CallbackId>>,
}

impl DvbManager {
    /// Resolves routes, creates the EPG filter handle and wires the parts
    /// together. No channel operation is possible before this returns.
    pub fn initialize(
        middleware: Arc<dyn Middleware>,
        ip_channels: IpChannelList,
        config: &ManagerConfig,
    ) -> Result<Self> {
        let routes = Arc::new(RouteTable::build(middleware.as_ref())?);
        let resolver = Arc::new(ChannelResolver::new(
            middleware.clone(),
            routes.clone(),
            ip_channels,
            config.list_index,
        ));
        let tuner = Tuner::new(middleware.clone(), resolver.clone());
        let epg = Arc::new(EpgAggregator::new(
            middleware.clone(),
            resolver.clone(),
            config.max_days,
        )?);

        info!(
            "DVB manager ready: list {}, mixed IP/broadcast: {}, {} channels",
            config.list_index,
            routes.is_mixed(),
            resolver.logical_count()?
        );

        Ok(Self {
            middleware,
            routes,
            resolver,
            tuner,
            epg,
            callback: Mutex::new(None),
        })
    }

    /// Registers for middleware EPG change notifications.
    ///
    /// The callback runs on whatever thread the middleware calls it from.
    /// It claims the load guard right there and, when it wins, hands the
    /// pass to the runtime's blocking pool. Notifications always reload the
    /// current day. A notification arriving during a pass is dropped.
    pub fn watch_epg_changes(&self, runtime: Handle) -> Result<()> {
        let mut registered = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if registered.is_some() {
            debug!("EPG change callback already registered");
            return Ok(());
        }

        let epg = Arc::downgrade(&self.epg);
        let callback: EpgCallback = Arc::new(move |notification| {
            debug!("EPG notification {:?}", notification);
            match epg.upgrade() {
                Some(epg) => {
                    epg.spawn_load(&runtime, DayDelta::Current);
                }
                None => debug!("EPG aggregator gone, ignoring notification"),
            }
        });

        let id = self
            .middleware
            .register_event_callback(self.epg.filter_id(), callback)?;
        *registered = Some(id);
        info!("Watching middleware EPG changes");
        Ok(())
    }

    /// Unregisters the EPG callback and stops playback.
    pub fn shutdown(&self) -> Result<()> {
        let registered = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = registered {
            self.middleware
                .unregister_event_callback(self.epg.filter_id(), id)?;
        }
        self.tuner.stop()?;
        info!("DVB manager shut down");
        Ok(())
    }

    /// Today's date as shown in the guide header before any load.
    pub fn initial_date(&self) -> Result<String> {
        Ok(format_date(self.middleware.current_time_date()?.date()))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn resolver(&self) -> &ChannelResolver {
        &self.resolver
    }

    pub fn tuner(&self) -> &Tuner {
        &self.tuner
    }

    pub fn epg(&self) -> &Arc<EpgAggregator> {
        &self.epg
    }
}
