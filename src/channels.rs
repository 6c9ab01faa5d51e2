use std::sync::{Arc, RwLock};

use anyhow::Result as AnyResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::middleware::{Middleware, SourceType};
use crate::routes::RouteTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpChannel {
    pub name: String,
    pub url: String,
}

const STREAM_SCHEMES: [&str; 5] = ["rtsp://", "rtp://", "udp://", "http://", "https://"];

pub fn parse_m3u(content: &str) -> AnyResult<Vec<IpChannel>> {
    let mut channels = Vec::new();
    let mut current_name = None;

    let re_extinf = Regex::new(r"#EXTINF:-?\d+[^,]*,(.*)")?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = re_extinf.captures(line) {
            current_name = Some(caps[1].trim().to_string());
        } else if STREAM_SCHEMES.iter().any(|s| line.starts_with(s)) {
            if let Some(name) = current_name.take() {
                channels.push(IpChannel {
                    name,
                    url: line.to_string(),
                });
            }
        }
    }

    Ok(channels)
}

/// IP channel list owned by the playlist loader. The engine only reads it.
#[derive(Debug, Clone, Default)]
pub struct IpChannelList {
    inner: Arc<RwLock<Vec<IpChannel>>>,
}

impl IpChannelList {
    pub fn new(channels: Vec<IpChannel>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(channels)),
        }
    }

    pub fn replace(&self, channels: Vec<IpChannel>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = channels,
            Err(poisoned) => *poisoned.into_inner() = channels,
        }
    }

    pub fn len(&self) -> usize {
        self.read(|c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<IpChannel> {
        self.read(|c| c.get(index).cloned())
    }

    pub fn names(&self) -> Vec<String> {
        self.read(|c| c.iter().map(|ch| ch.name.clone()).collect())
    }

    fn read<T>(&self, f: impl FnOnce(&Vec<IpChannel>) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Broadcast,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// 1-based number shown to the viewer.
    pub number: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedChannel {
    pub kind: ServiceKind,
    pub physical_index: usize,
    pub info: ChannelInfo,
    pub source: SourceType,
    pub scrambled: bool,
    /// Stream address for IP channels.
    pub url: Option<String>,
}

/// Snapshot of how logical indices split between broadcast and IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelLayout {
    pub broadcast_count: usize,
    pub ip_count: usize,
    /// 1 when the broadcast list starts with a dummy entry.
    pub dummy_offset: usize,
}

impl ChannelLayout {
    pub fn new(routes: &RouteTable, raw_service_count: usize, ip_list_len: usize) -> Self {
        let ip_count = if routes.has_ip() { ip_list_len } else { 0 };
        let (broadcast_count, dummy_offset) = if routes.is_mixed() {
            (raw_service_count.saturating_sub(1), 1)
        } else if routes.has_ip() {
            // IP only: the middleware service list is not shown.
            (0, 0)
        } else {
            (raw_service_count, 0)
        };
        Self {
            broadcast_count,
            ip_count,
            dummy_offset,
        }
    }

    pub fn logical_count(&self) -> usize {
        self.broadcast_count + self.ip_count
    }

    /// Maps a logical index onto the list that holds it.
    pub fn locate(&self, logical: usize) -> Result<(ServiceKind, usize)> {
        if logical >= self.logical_count() {
            return Err(EngineError::OutOfRange {
                index: logical,
                count: self.logical_count(),
            });
        }
        if logical < self.broadcast_count {
            Ok((ServiceKind::Broadcast, logical + self.dummy_offset))
        } else {
            Ok((ServiceKind::Ip, logical - self.broadcast_count))
        }
    }

    /// Physical middleware index of a broadcast channel.
    pub fn broadcast_physical(&self, logical: usize) -> usize {
        logical + self.dummy_offset
    }

    /// Inverse of [`broadcast_physical`](Self::broadcast_physical).
    pub fn broadcast_logical(&self, physical: usize) -> Option<usize> {
        physical
            .checked_sub(self.dummy_offset)
            .filter(|l| *l < self.broadcast_count)
    }
}

/// Maps logical channel numbers onto middleware services and IP streams.
pub struct ChannelResolver {
    middleware: Arc<dyn Middleware>,
    routes: Arc<RouteTable>,
    ip_channels: IpChannelList,
    list_index: usize,
}

impl ChannelResolver {
    pub fn new(
        middleware: Arc<dyn Middleware>,
        routes: Arc<RouteTable>,
        ip_channels: IpChannelList,
        list_index: usize,
    ) -> Self {
        Self {
            middleware,
            routes,
            ip_channels,
            list_index,
        }
    }

    pub fn list_index(&self) -> usize {
        self.list_index
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn layout(&self) -> Result<ChannelLayout> {
        let raw = self.middleware.service_count(self.list_index)?;
        Ok(ChannelLayout::new(&self.routes, raw, self.ip_channels.len()))
    }

    pub fn logical_count(&self) -> Result<usize> {
        Ok(self.layout()?.logical_count())
    }

    pub fn resolve_channel(&self, logical: usize) -> Result<ResolvedChannel> {
        let layout = self.layout()?;
        let (kind, physical_index) = layout.locate(logical)?;
        let number = logical + 1;

        match kind {
            ServiceKind::Broadcast => {
                let descriptor = self
                    .middleware
                    .service_descriptor(self.list_index, physical_index)?;
                debug!(
                    "Channel {} -> broadcast service {} ({})",
                    logical, physical_index, descriptor.name
                );
                Ok(ResolvedChannel {
                    kind,
                    physical_index,
                    info: ChannelInfo {
                        number,
                        name: descriptor.name,
                    },
                    source: descriptor.source,
                    scrambled: descriptor.scrambled,
                    url: None,
                })
            }
            ServiceKind::Ip => {
                // The list may have shrunk since the layout was taken.
                let channel = self.ip_channels.get(physical_index).ok_or(
                    EngineError::OutOfRange {
                        index: logical,
                        count: layout.broadcast_count + self.ip_channels.len(),
                    },
                )?;
                debug!("Channel {} -> IP stream {} ({})", logical, physical_index, channel.name);
                Ok(ResolvedChannel {
                    kind,
                    physical_index,
                    info: ChannelInfo {
                        number,
                        name: channel.name,
                    },
                    source: SourceType::Ip,
                    scrambled: false,
                    url: Some(channel.url),
                })
            }
        }
    }

    pub fn channel_info(&self, logical: usize) -> Result<ChannelInfo> {
        Ok(self.resolve_channel(logical)?.info)
    }

    /// All logical channel names: broadcast first (dummy skipped), then IP.
    pub fn channel_names(&self) -> Result<Vec<String>> {
        let layout = self.layout()?;
        let mut names = Vec::with_capacity(layout.logical_count());
        for logical in 0..layout.broadcast_count {
            let descriptor = self
                .middleware
                .service_descriptor(self.list_index, layout.broadcast_physical(logical))?;
            names.push(descriptor.name);
        }
        if self.routes.has_ip() {
            names.extend(self.ip_channels.names());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::FrontendType;
    use crate::simulated::{Fixture, SimulatedMiddleware};
    use chrono::NaiveDate;

    #[test]
    fn test_parse_m3u() {
        let data = r#"#EXTM3U
#EXTINF:0,3sat SD
#EXTVLCOPT:network-caching=1000
rtsp://192.168.178.1:554/?avm=1&freq=450&bw=8&msys=dvbc&mtype=256qam&sr=6900&specinv=1&pids=0,16,17,18,20,200,210,220,221,222,231,250
#EXTINF:-1 tvg-id="kika",KiKA SD
http://iptv.example/kika.m3u8
#EXTINF:0,Orphan without url
#EXTINF:0,Multicast
udp://@239.0.0.1:1234"#;

        let channels = parse_m3u(data).unwrap();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].name, "3sat SD");
        assert!(channels[0].url.starts_with("rtsp://"));
        assert_eq!(channels[1].name, "KiKA SD");
        assert_eq!(channels[2].name, "Multicast");
        assert_eq!(channels[2].url, "udp://@239.0.0.1:1234");
    }

    fn ip(n: usize) -> IpChannelList {
        IpChannelList::new(
            (0..n)
                .map(|i| IpChannel {
                    name: format!("IP {i}"),
                    url: format!("http://stream/{i}"),
                })
                .collect(),
        )
    }

    fn resolver(frontends: &[FrontendType], services: &[&str], ip_channels: IpChannelList) -> ChannelResolver {
        let mut fixture = Fixture::at(
            NaiveDate::from_ymd_opt(2026, 10, 18)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
        .frontend(0, frontends);
        for name in services {
            fixture = fixture.service(name, SourceType::Cab);
        }
        let mw: Arc<dyn Middleware> = Arc::new(SimulatedMiddleware::new(fixture));
        let routes = Arc::new(RouteTable::build(mw.as_ref()).unwrap());
        ChannelResolver::new(mw, routes, ip_channels, 0)
    }

    #[test]
    fn test_mixed_list_skips_dummy_entry() {
        let r = resolver(
            &[FrontendType::Cab, FrontendType::Ip],
            &["DUMMY", "Das Erste", "ZDF", "arte"],
            ip(2),
        );
        assert_eq!(r.logical_count().unwrap(), 5);

        let first = r.resolve_channel(0).unwrap();
        assert_eq!(first.kind, ServiceKind::Broadcast);
        assert_eq!(first.physical_index, 1);
        assert_eq!(first.info, ChannelInfo { number: 1, name: "Das Erste".into() });

        let last_dvb = r.resolve_channel(2).unwrap();
        assert_eq!(last_dvb.physical_index, 3);

        let first_ip = r.resolve_channel(3).unwrap();
        assert_eq!(first_ip.kind, ServiceKind::Ip);
        assert_eq!(first_ip.physical_index, 0);
        assert_eq!(first_ip.info.number, 4);
        assert_eq!(first_ip.url.as_deref(), Some("http://stream/0"));

        assert_eq!(
            r.channel_names().unwrap(),
            vec!["Das Erste", "ZDF", "arte", "IP 0", "IP 1"]
        );
    }

    #[test]
    fn test_every_index_splits_consistently() {
        let r = resolver(
            &[FrontendType::Cab, FrontendType::Ip],
            &["DUMMY", "A", "B"],
            ip(3),
        );
        let layout = r.layout().unwrap();
        let dtv = layout.logical_count() - layout.ip_count;
        for i in 0..layout.logical_count() {
            let resolved = r.resolve_channel(i).unwrap();
            if i < dtv {
                assert_eq!(resolved.kind, ServiceKind::Broadcast);
                assert_eq!(resolved.physical_index, i + 1);
            } else {
                assert_eq!(resolved.kind, ServiceKind::Ip);
                assert_eq!(resolved.physical_index, i - dtv);
            }
            assert_eq!(resolved.info.number, i + 1);
        }
        assert_eq!(
            r.resolve_channel(5),
            Err(EngineError::OutOfRange { index: 5, count: 5 })
        );
    }

    #[test]
    fn test_broadcast_only_uses_raw_indices_and_ignores_ip_list() {
        let r = resolver(&[FrontendType::Ter], &["One", "Two"], ip(4));
        assert_eq!(r.logical_count().unwrap(), 2);
        assert_eq!(r.resolve_channel(0).unwrap().physical_index, 0);
        assert_eq!(r.channel_names().unwrap(), vec!["One", "Two"]);
        assert!(r.resolve_channel(2).is_err());
    }

    #[test]
    fn test_ip_only_counts_just_ip_channels() {
        let r = resolver(&[FrontendType::Ip], &["ignored", "ignored too"], ip(2));
        assert_eq!(r.logical_count().unwrap(), 2);
        let c = r.resolve_channel(1).unwrap();
        assert_eq!(c.kind, ServiceKind::Ip);
        assert_eq!(c.physical_index, 1);
        assert_eq!(r.channel_names().unwrap(), vec!["IP 0", "IP 1"]);
    }

    #[test]
    fn test_layout_round_trips_physical_indices() {
        let layout = ChannelLayout {
            broadcast_count: 3,
            ip_count: 1,
            dummy_offset: 1,
        };
        assert_eq!(layout.broadcast_logical(0), None);
        assert_eq!(layout.broadcast_logical(1), Some(0));
        assert_eq!(layout.broadcast_logical(3), Some(2));
        assert_eq!(layout.broadcast_logical(4), None);
    }
}
