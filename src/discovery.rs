use crate::config::{PROTOCOL_VERSION, SERVICE_TYPE};
use crate::error::{Result, TeamError};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

pub const TXT_TEAM_ID: &str = "team_id";
pub const TXT_LEADER_NAME: &str = "leader_name";
pub const TXT_MEMBER_COUNT: &str = "member_count";
pub const TXT_VERSION: &str = "version";

/// A discovery record, either ours to publish or one we heard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRecord {
    pub instance_name: String,
    pub service_type: String,
    pub domain: String,
    pub port: u16,
    /// IPv4 addresses the record points at.
    pub addresses: Vec<String>,
    pub txt: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn for_team(
        team_id: &str,
        team_name: &str,
        leader_name: &str,
        member_count: usize,
        addresses: Vec<String>,
        port: u16,
    ) -> Self {
        let mut txt = BTreeMap::new();
        txt.insert(TXT_TEAM_ID.to_string(), team_id.to_string());
        txt.insert(TXT_LEADER_NAME.to_string(), leader_name.to_string());
        txt.insert(TXT_MEMBER_COUNT.to_string(), member_count.to_string());
        txt.insert(TXT_VERSION.to_string(), PROTOCOL_VERSION.to_string());
        Self {
            instance_name: team_name.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            domain: "local.".to_string(),
            port,
            addresses,
            txt,
        }
    }
}

/// A team found on the LAN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredTeam {
    pub team_id: String,
    pub name: String,
    pub leader_name: String,
    pub endpoint: String,
    pub member_count: usize,
    pub version: String,
}

impl DiscoveredTeam {
    /// `None` for records that carry no team id.
    pub fn from_record(record: &ServiceRecord) -> Option<Self> {
        let team_id = record.txt.get(TXT_TEAM_ID).filter(|id| !id.is_empty())?;
        let ip = record.addresses.first()?;
        Some(Self {
            team_id: team_id.clone(),
            name: record.instance_name.clone(),
            leader_name: record.txt.get(TXT_LEADER_NAME).cloned().unwrap_or_default(),
            endpoint: format!("{}:{}", ip, record.port),
            member_count: record
                .txt
                .get(TXT_MEMBER_COUNT)
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
            version: record.txt.get(TXT_VERSION).cloned().unwrap_or_default(),
        })
    }
}

/// Publishes a team's presence.
pub trait Advertiser: Send + Sync {
    fn advertise(&self, record: ServiceRecord) -> Result<()>;
    /// Merges attributes into the live record by re-publishing it.
    fn update_attributes(&self, attrs: HashMap<String, String>) -> Result<()>;
    fn stop(&self);
    fn is_advertising(&self) -> bool;
}

/// Shared bookkeeping for advertisers: the record being published.
fn merged(mut record: ServiceRecord, attrs: HashMap<String, String>) -> ServiceRecord {
    record.txt.extend(attrs);
    record
}

struct Published {
    fullname: String,
    record: ServiceRecord,
}

/// Advertises over multicast DNS.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    published: Mutex<Option<Published>>,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            published: Mutex::new(None),
        })
    }

    fn register(&self, record: &ServiceRecord) -> Result<String> {
        if record.addresses.is_empty() {
            return Err(TeamError::NoValidInterface);
        }

        // Format: <system hostname>.local.
        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "lanteam".to_string());
        let host_name = format!("{}.local.", system_hostname.replace('.', "-"));

        let properties: HashMap<String, String> = record
            .txt
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let service_info = ServiceInfo::new(
            &record.service_type,
            &record.instance_name,
            &host_name,
            record.addresses.join(",").as_str(),
            record.port,
            properties,
        )?;
        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info)?;
        tracing::info!(
            "Registered service: {} on {:?}:{}",
            fullname,
            record.addresses,
            record.port
        );
        Ok(fullname)
    }

    fn unregister(&self, fullname: &str) {
        tracing::info!("Unregistering service: {}", fullname);
        if let Err(e) = self.daemon.unregister(fullname) {
            tracing::error!("Failed to unregister service: {}", e);
        }
    }
}

impl Advertiser for MdnsAdvertiser {
    fn advertise(&self, record: ServiceRecord) -> Result<()> {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if published.is_some() {
            return Err(TeamError::AlreadyAdvertising);
        }
        let fullname = self.register(&record)?;
        *published = Some(Published { fullname, record });
        Ok(())
    }

    fn update_attributes(&self, attrs: HashMap<String, String>) -> Result<()> {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = published.take().ok_or(TeamError::NotAdvertising)?;
        // mDNS records cannot be edited in place; there is a short gap here.
        self.unregister(&current.fullname);
        let record = merged(current.record, attrs);
        let fullname = self.register(&record)?;
        *published = Some(Published { fullname, record });
        Ok(())
    }

    fn stop(&self) {
        let taken = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(current) = taken {
            self.unregister(&current.fullname);
        }
    }

    fn is_advertising(&self) -> bool {
        self.published
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        let had_record = self.is_advertising();
        self.stop();
        if had_record {
            // Give the daemon time to send the goodbye packet before it shuts down
            std::thread::sleep(Duration::from_millis(300));
        }
        let _ = self.daemon.shutdown();
    }
}

/// Keeps the record in memory only. For hosts without multicast, and tests.
#[derive(Default)]
pub struct MemoryAdvertiser {
    record: Mutex<Option<ServiceRecord>>,
}

impl MemoryAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<ServiceRecord> {
        self.record.lock().ok().and_then(|r| r.clone())
    }
}

impl Advertiser for MemoryAdvertiser {
    fn advertise(&self, record: ServiceRecord) -> Result<()> {
        let mut current = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_some() {
            return Err(TeamError::AlreadyAdvertising);
        }
        if record.addresses.is_empty() {
            return Err(TeamError::NoValidInterface);
        }
        *current = Some(record);
        Ok(())
    }

    fn update_attributes(&self, attrs: HashMap<String, String>) -> Result<()> {
        let mut current = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = current.take().ok_or(TeamError::NotAdvertising)?;
        *current = Some(merged(record, attrs));
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut current) = self.record.lock() {
            *current = None;
        }
    }

    fn is_advertising(&self) -> bool {
        self.record.lock().map(|r| r.is_some()).unwrap_or(false)
    }
}

/// Listens for team advertisements.
pub struct Browser {
    daemon: ServiceDaemon,
}

impl Browser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
        })
    }

    /// Collects every resolved record heard within `timeout`.
    pub async fn browse(&self, timeout: Duration) -> Result<Vec<ServiceRecord>> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut found: BTreeMap<String, ServiceRecord> = BTreeMap::new();

        loop {
            let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Browse channel closed");
                    break;
                }
                Err(_) => break,
            };

            if let ServiceEvent::ServiceResolved(info) = event {
                let addresses: Vec<String> = info
                    .get_addresses()
                    .iter()
                    .filter_map(|a| a.to_string().parse::<Ipv4Addr>().ok())
                    .map(|a| a.to_string())
                    .collect();
                if addresses.is_empty() {
                    tracing::debug!("Dropping record without IPv4: {}", info.get_fullname());
                    continue;
                }

                // A bare key (no '=') comes back with an empty value.
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect();

                let fullname = info.get_fullname().to_string();
                let instance_name = fullname
                    .strip_suffix(&format!(".{}", SERVICE_TYPE))
                    .unwrap_or(&fullname)
                    .to_string();

                tracing::debug!("Resolved team service {} at {:?}", fullname, addresses);
                found.insert(
                    fullname,
                    ServiceRecord {
                        instance_name,
                        service_type: SERVICE_TYPE.to_string(),
                        domain: "local.".to_string(),
                        port: info.get_port(),
                        addresses,
                        txt,
                    },
                );
            }
        }

        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        Ok(found.into_values().collect())
    }

    pub async fn discover_teams(&self, timeout: Duration) -> Result<Vec<DiscoveredTeam>> {
        let records = self.browse(timeout).await?;
        Ok(records.iter().filter_map(DiscoveredTeam::from_record).collect())
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}
