use crate::client::{JoinRequest, JoinResponse, LeaderClient};
use crate::connection_manager::ConnectionManager;
use crate::directory::TeamDirectory;
use crate::discovery::{Advertiser, ServiceRecord, TXT_MEMBER_COUNT};
use crate::error::{Result, TeamError};
use crate::hub::{EventHandler, LeaderHub};
use crate::index::{CapabilityIndexStore, IndexRegistry, SkillEntry, TeamSkillIndex};
use crate::network::{parse_endpoint, NetworkResolver};
use crate::peer::{Identity, Team, TeamMember};
use crate::protocol::{
    Event, EventType, MemberJoinedPayload, MemberLeftPayload, MemberStatusPayload,
    SkillDeletedPayload, SkillUpdatedPayload, TeamDissolvedPayload,
};
use crate::storage::{IdentityStore, NetworkConfigStore};
use crate::sync::{SyncNotice, SyncObserver};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long a dissolving leader waits for the farewell event to go out.
const DISSOLVE_GRACE: Duration = Duration::from_secs(2);

/// Everything the coordinator needs, assembled by the node.
pub struct CoordinatorParts {
    pub identity: Arc<IdentityStore>,
    pub network: Arc<NetworkConfigStore>,
    pub resolver: NetworkResolver,
    pub advertiser: Arc<dyn Advertiser>,
    pub directory: Arc<TeamDirectory>,
    pub indexes: Arc<IndexRegistry>,
    pub hub: Arc<LeaderHub>,
    pub connections: Arc<ConnectionManager>,
    pub client: LeaderClient,
    pub port: u16,
}

/// Create/join/leave/dissolve, plus the leader's request handlers.
pub struct TeamCoordinator {
    identity: Arc<IdentityStore>,
    network: Arc<NetworkConfigStore>,
    resolver: NetworkResolver,
    advertiser: Arc<dyn Advertiser>,
    directory: Arc<TeamDirectory>,
    indexes: Arc<IndexRegistry>,
    hub: Arc<LeaderHub>,
    connections: Arc<ConnectionManager>,
    client: LeaderClient,
    port: u16,
}

impl TeamCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            identity: parts.identity,
            network: parts.network,
            resolver: parts.resolver,
            advertiser: parts.advertiser,
            directory: parts.directory,
            indexes: parts.indexes,
            hub: parts.hub,
            connections: parts.connections,
            client: parts.client,
            port: parts.port,
        }
    }

    pub fn directory(&self) -> &Arc<TeamDirectory> {
        &self.directory
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.get()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sets (or renames) the local identity and refreshes live connections.
    pub fn set_identity(&self, name: &str) -> Result<Identity> {
        let identity = self.identity.ensure(name)?;
        self.connections.update_identity(&identity.id, &identity.name);
        Ok(identity)
    }

    fn broadcast<P: Serialize>(&self, team_id: &str, kind: EventType, payload: &P) {
        let event = match Event::new(kind.clone(), team_id, payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(team_id, %kind, error = %e, "Failed to build event");
                return;
            }
        };
        match self.hub.broadcast(team_id, &event) {
            Ok(n) => tracing::debug!(team_id, %kind, delivered = n, "Broadcast"),
            Err(e) => tracing::warn!(team_id, %kind, error = %e, "Broadcast failed"),
        }
    }

    fn leader_team(&self, team_id: &str) -> Result<Team> {
        let team = self.directory.require(team_id)?;
        if !team.is_leader {
            return Err(TeamError::NotTeamLeader);
        }
        Ok(team)
    }

    fn advertise(&self, team: &Team) {
        let addresses = match self.resolver.all_ips() {
            Ok(ips) => ips,
            Err(e) => {
                tracing::warn!(team_id = %team.id, error = %e, "No addresses to advertise on");
                return;
            }
        };
        let record = ServiceRecord::for_team(
            &team.id,
            &team.name,
            &team.leader_name,
            team.member_count,
            addresses,
            self.port,
        );
        if let Err(e) = self.advertiser.advertise(record) {
            tracing::warn!(team_id = %team.id, error = %e, "Failed to advertise team");
        }
    }

    /// Recomputes the member count from the roster and republishes it.
    fn refresh_member_count(&self, team_id: &str) {
        let count = self.directory.roster(team_id).count();
        if let Err(e) = self.directory.update(team_id, |t| t.member_count = count) {
            tracing::warn!(team_id, error = %e, "Failed to update member count");
        }
        let mut attrs = HashMap::new();
        attrs.insert(TXT_MEMBER_COUNT.to_string(), count.to_string());
        if let Err(e) = self.advertiser.update_attributes(attrs) {
            tracing::warn!(team_id, error = %e, "Failed to refresh advertisement");
        }
    }

    pub async fn create_team(
        &self,
        name: &str,
        preferred_interface: &str,
        preferred_ip: &str,
    ) -> Result<Team> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TeamError::TeamNameRequired);
        }
        if self.directory.leader_team().is_some() {
            return Err(TeamError::TeamAlreadyExists);
        }
        let identity = self.identity.require()?;

        if !preferred_interface.is_empty() || !preferred_ip.is_empty() {
            self.network.set(preferred_interface, preferred_ip)?;
        }
        let endpoint = self
            .resolver
            .build_endpoint(Some(&self.network.get()), self.port)?;

        let now = Utc::now();
        let team = Team {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            leader_id: identity.id.clone(),
            leader_name: identity.name.clone(),
            leader_endpoint: endpoint.address(),
            member_count: 1,
            skill_count: 0,
            created_at: now,
            joined_at: now,
            is_leader: true,
            leader_online: true,
            last_sync_at: None,
        };
        self.directory.add(team.clone())?;
        self.directory
            .roster(&team.id)
            .add_leader(&identity.id, &identity.name, &endpoint.address());
        self.indexes.get_or_open(&team.id);
        self.hub.open_team(&team.id);
        self.advertise(&team);

        tracing::info!(team_id = %team.id, name = %team.name, endpoint = %team.leader_endpoint, "Created team");
        Ok(team)
    }

    pub async fn join_team(&self, endpoint: &str) -> Result<Team> {
        let identity = self.identity.require()?;
        let (host, _) = parse_endpoint(endpoint)?;

        let local_ip = match self.resolver.select_matching_local_ip(&host) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!(%host, error = %e, "No matching local IP, using primary");
                self.resolver.primary_ip(Some(&self.network.get()))?
            }
        };
        let my_endpoint = format!("{}:{}", local_ip, self.port);

        let info = self.client.team_info(endpoint).await?;
        let team_id = info.team.id.clone();
        if self.directory.is_leader_of(&team_id) {
            return Err(TeamError::AlreadyTeamMember(team_id));
        }

        let req = JoinRequest {
            member_id: identity.id.clone(),
            member_name: identity.name.clone(),
            endpoint: my_endpoint.clone(),
        };
        let resp = self.client.join(endpoint, &team_id, &req).await?;
        if !resp.success {
            return Err(TeamError::JoinRejected(
                resp.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let remote = resp.team.unwrap_or(info.team);
        let skills = resp.skill_index.map(|i| i.skills).unwrap_or_default();
        let team = Team {
            id: remote.id.clone(),
            name: remote.name,
            leader_id: remote.leader_id,
            leader_name: remote.leader_name,
            // the address that worked for us, not whatever the leader guessed
            leader_endpoint: endpoint.to_string(),
            member_count: remote.member_count.max(resp.members.len()),
            skill_count: skills.len(),
            created_at: remote.created_at,
            joined_at: Utc::now(),
            is_leader: false,
            leader_online: true,
            last_sync_at: Some(Utc::now()),
        };
        self.directory.upsert(team.clone());
        self.directory.roster(&team.id).replace_all(resp.members);
        self.indexes.get_or_open(&team.id).replace_all(skills)?;

        self.connections.update_local_endpoint(&my_endpoint);
        let connections = self.connections.clone();
        let (id, leader) = (team.id.clone(), endpoint.to_string());
        tokio::spawn(async move {
            if let Err(e) = connections.connect(&id, &leader).await {
                tracing::warn!(team_id = %id, error = %e, "Could not connect to leader yet");
            }
        });

        tracing::info!(team_id = %team.id, name = %team.name, leader = %endpoint, "Joined team");
        Ok(team)
    }

    pub async fn leave_team(&self, team_id: &str) -> Result<()> {
        let team = self.directory.require(team_id)?;
        if team.is_leader {
            return Err(TeamError::IsTeamLeader);
        }

        if let Some(identity) = self.identity.get() {
            if let Err(e) = self
                .client
                .leave(&team.leader_endpoint, team_id, &identity.id)
                .await
            {
                tracing::debug!(team_id, error = %e, "Leader not notified of leave");
            }
        }

        self.connections.disconnect(team_id);
        self.indexes.remove(team_id);
        self.directory.remove(team_id);
        tracing::info!(team_id, "Left team");
        Ok(())
    }

    pub async fn dissolve_team(&self, team_id: &str) -> Result<()> {
        let team = self.leader_team(team_id)?;
        let dissolved_by = self
            .identity
            .get()
            .map(|i| i.name)
            .unwrap_or_else(|| team.leader_name.clone());

        self.broadcast(
            team_id,
            EventType::TeamDissolved,
            &TeamDissolvedPayload {
                team_id: team.id.clone(),
                team_name: team.name.clone(),
                dissolved_by,
                dissolved_at: Utc::now(),
            },
        );
        self.hub.close_team_when_drained(team_id, DISSOLVE_GRACE).await;
        self.advertiser.stop();
        self.indexes.remove(team_id);
        self.directory.remove(team_id);
        tracing::info!(team_id, name = %team.name, "Dissolved team");
        Ok(())
    }

    /// Leader side of a join. Problems are reported in the response.
    pub fn handle_join_request(&self, team_id: &str, req: JoinRequest) -> JoinResponse {
        if !self.directory.is_leader_of(team_id) {
            return JoinResponse::rejected("not the leader of this team");
        }
        if req.member_id.is_empty() {
            return JoinResponse::rejected("member_id is required");
        }

        let roster = self.directory.roster(team_id);
        let joined_at = Utc::now();
        let added = roster.add(TeamMember {
            id: req.member_id.clone(),
            name: req.member_name.clone(),
            endpoint: req.endpoint.clone(),
            is_leader: false,
            is_online: true,
            joined_at,
        });
        match added {
            Ok(()) => {
                self.broadcast(
                    team_id,
                    EventType::MemberJoined,
                    &MemberJoinedPayload {
                        member_id: req.member_id.clone(),
                        member_name: req.member_name.clone(),
                        endpoint: req.endpoint.clone(),
                        joined_at,
                    },
                );
                self.refresh_member_count(team_id);
                tracing::info!(team_id, member_id = %req.member_id, name = %req.member_name, "Member joined");
            }
            Err(TeamError::AlreadyTeamMember(_)) => {
                if let Err(e) = roster.update_endpoint(&req.member_id, &req.endpoint) {
                    tracing::warn!(team_id, error = %e, "Failed to update member endpoint");
                }
                roster.set_online(&req.member_id, true);
                tracing::info!(team_id, member_id = %req.member_id, "Member re-joined");
            }
            Err(e) => return JoinResponse::rejected(&e.to_string()),
        }

        JoinResponse {
            success: true,
            team: self.directory.get(team_id),
            members: roster.list(),
            skill_index: Some(self.indexes.get_or_open(team_id).snapshot()),
            error: None,
        }
    }

    /// Leader side of a leave. Unknown members are not an error.
    pub fn handle_leave_request(&self, team_id: &str, member_id: &str) -> Result<()> {
        self.leader_team(team_id)?;
        let Some(member) = self.directory.roster(team_id).remove(member_id) else {
            return Ok(());
        };
        self.broadcast(
            team_id,
            EventType::MemberLeft,
            &MemberLeftPayload {
                member_id: member.id.clone(),
                member_name: member.name.clone(),
                left_at: Utc::now(),
            },
        );
        self.refresh_member_count(team_id);
        tracing::info!(team_id, member_id, "Member left");
        Ok(())
    }

    /// Roster straight from memory on the leader, from the leader otherwise.
    /// A member falls back to its cached copy when the leader is unreachable.
    pub async fn get_team_members(&self, team_id: &str) -> Result<Vec<TeamMember>> {
        let team = self.directory.require(team_id)?;
        let roster = self.directory.roster(team_id);
        if team.is_leader {
            return Ok(roster.list());
        }

        match self.client.members(&team.leader_endpoint, team_id).await {
            Ok(members) => {
                roster.replace_all(members.clone());
                Ok(members)
            }
            Err(e) if e.is_unreachable() => {
                let _ = self.directory.set_leader_online(team_id, false);
                let cached = roster.list();
                if cached.is_empty() {
                    Err(e)
                } else {
                    tracing::warn!(team_id, error = %e, "Leader offline, serving cached members");
                    Ok(cached)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Local index when one is held, otherwise pulled from the leader.
    pub async fn get_capability_index(&self, team_id: &str) -> Result<TeamSkillIndex> {
        let team = self.directory.require(team_id)?;
        if let Some(index) = self.indexes.get(team_id) {
            return Ok(index.snapshot());
        }
        if team.is_leader {
            return Ok(self.indexes.get_or_open(team_id).snapshot());
        }
        let remote = self.client.skills(&team.leader_endpoint, team_id).await?;
        self.indexes
            .get_or_open(team_id)
            .replace_all(remote.skills.clone())?;
        Ok(remote)
    }

    pub fn publish_capability(&self, team_id: &str, entry: SkillEntry) -> Result<SkillEntry> {
        self.leader_team(team_id)?;
        let index = self.indexes.get_or_open(team_id);
        index.upsert(entry.clone())?;
        let count = index.len();
        self.directory.update(team_id, |t| t.skill_count = count)?;
        self.broadcast(team_id, EventType::SkillPublished, &entry);
        tracing::info!(team_id, plugin_id = %entry.plugin_id, version = %entry.version, "Published capability");
        Ok(entry)
    }

    pub fn update_capability(
        &self,
        team_id: &str,
        plugin_id: &str,
        version: &str,
        checksum: &str,
    ) -> Result<()> {
        self.leader_team(team_id)?;
        let index = self.indexes.get_or_open(team_id);
        if !index.update_version(plugin_id, version, checksum)? {
            return Err(TeamError::SkillNotFound(plugin_id.to_string()));
        }
        self.broadcast(
            team_id,
            EventType::SkillUpdated,
            &SkillUpdatedPayload {
                plugin_id: plugin_id.to_string(),
                version: version.to_string(),
                checksum: checksum.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn remove_capability(&self, team_id: &str, plugin_id: &str, deleted_by: &str) -> Result<()> {
        self.leader_team(team_id)?;
        let index = self.indexes.get_or_open(team_id);
        if !index.remove(plugin_id)? {
            return Err(TeamError::SkillNotFound(plugin_id.to_string()));
        }
        let count = index.len();
        self.directory.update(team_id, |t| t.skill_count = count)?;
        self.broadcast(
            team_id,
            EventType::SkillDeleted,
            &SkillDeletedPayload {
                plugin_id: plugin_id.to_string(),
                deleted_by: deleted_by.to_string(),
                deleted_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Publishes locally when leading, otherwise asks the leader to.
    pub async fn share_capability(&self, team_id: &str, entry: SkillEntry) -> Result<()> {
        let team = self.directory.require(team_id)?;
        if team.is_leader {
            self.publish_capability(team_id, entry)?;
            return Ok(());
        }
        self.client
            .publish_skill(&team.leader_endpoint, team_id, &entry)
            .await
    }

    /// Downloads a capability from its author into `dest`.
    pub async fn fetch_capability(&self, team_id: &str, plugin_id: &str, dest: &Path) -> Result<()> {
        let index = self.get_capability_index(team_id).await?;
        let entry = index
            .skills
            .into_iter()
            .find(|s| s.plugin_id == plugin_id)
            .ok_or_else(|| TeamError::SkillNotFound(plugin_id.to_string()))?;
        let meta = self
            .client
            .fetch_skill(&entry.author_endpoint, plugin_id, dest)
            .await?;
        if !entry.checksum.is_empty() && meta.checksum != entry.checksum {
            tracing::warn!(team_id, plugin_id, "Author serves a different version than the index lists");
        }
        Ok(())
    }

    /// Brings persisted teams back after a restart.
    pub async fn restore(&self) {
        for team in self.directory.list() {
            if team.is_leader {
                self.directory.roster(&team.id);
                self.indexes.get_or_open(&team.id);
                self.hub.open_team(&team.id);
                self.advertise(&team);
                tracing::info!(team_id = %team.id, "Resumed leading team");
            } else {
                let _ = self.directory.set_leader_online(&team.id, false);
                self.indexes.get_or_open(&team.id);
                let connections = self.connections.clone();
                tokio::spawn(async move {
                    if let Err(e) = connections.connect(&team.id, &team.leader_endpoint).await {
                        tracing::info!(team_id = %team.id, error = %e, "Leader not reachable yet");
                    }
                });
            }
        }
    }

    pub fn shutdown(&self) {
        self.advertiser.stop();
        self.hub.close();
        self.connections.close();
    }
}

impl EventHandler for TeamCoordinator {
    fn handle_event(&self, team_id: &str, member_id: &str, event: Event) {
        match &event.kind {
            EventType::MemberOnline | EventType::MemberOffline => {
                let online = event.kind == EventType::MemberOnline;
                let Some(member) = self.directory.roster(team_id).set_online(member_id, online) else {
                    tracing::debug!(team_id, member_id, "Status for member not on roster");
                    return;
                };
                self.broadcast(
                    team_id,
                    event.kind.clone(),
                    &MemberStatusPayload {
                        member_id: member.id,
                        member_name: member.name,
                        endpoint: member.endpoint,
                        is_online: online,
                    },
                );
            }
            kind if kind.is_relayed() => {
                if let Err(e) = self.hub.broadcast_except(team_id, &event, Some(member_id)) {
                    tracing::warn!(team_id, %kind, error = %e, "Relay failed");
                }
            }
            kind => {
                tracing::debug!(team_id, member_id, %kind, "Ignoring member event");
            }
        }
    }
}

impl SyncObserver for TeamCoordinator {
    fn notify(&self, notice: &SyncNotice) {
        if let SyncNotice::TeamDissolved { team_id, .. } = notice {
            self.connections.disconnect(team_id);
        }
    }
}
