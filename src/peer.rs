use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The local peer. One per data directory, renamed but never recreated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Random human-friendly name, used when the user never picked one.
    pub fn generated_name() -> String {
        let mut generator = names::Generator::default();
        generator.next().unwrap_or_else(|| "anonymous-peer".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub leader_id: String,
    pub leader_name: String,
    pub leader_endpoint: String,
    pub member_count: usize,
    pub skill_count: usize,
    pub created_at: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
    pub is_leader: bool,
    pub leader_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub is_leader: bool,
    pub is_online: bool,
    pub joined_at: DateTime<Utc>,
}

/// User preference for which interface/address to advertise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub preferred_interface: String,
    #[serde(default)]
    pub preferred_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A usable LAN interface, rebuilt on every enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<String>,
    pub is_up: bool,
    pub is_loopback: bool,
    pub is_virtual: bool,
}

/// Where a peer can be reached, every address in preference order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberEndpoint {
    pub primary_ip: String,
    pub all_ips: Vec<String>,
    pub port: u16,
    #[serde(default)]
    pub preferred_interface: String,
}

impl MemberEndpoint {
    /// `ip:port` for the primary address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.primary_ip, self.port)
    }

    /// `ip:port` for every address, primary first.
    pub fn all_addresses(&self) -> Vec<String> {
        let mut out = vec![self.address()];
        for ip in &self.all_ips {
            let addr = format!("{}:{}", ip, self.port);
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        out
    }
}
