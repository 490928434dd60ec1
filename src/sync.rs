use crate::client::LeaderClient;
use crate::config::SYNC_AFTER_CONNECT_TIMEOUT;
use crate::directory::TeamDirectory;
use crate::error::{Result, TeamError};
use crate::index::{CapabilityIndexStore, IndexRegistry, SkillEntry};
use crate::peer::TeamMember;
use crate::protocol::{Event, EventBody};
use crate::transport::EventListener;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What changed in a member's mirror of team state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    SkillChanged { team_id: String, entry: SkillEntry },
    SkillRemoved { team_id: String, plugin_id: String },
    MemberJoined { team_id: String, member_id: String, member_name: String },
    MemberLeft { team_id: String, member_id: String, member_name: String },
    TeamDissolved { team_id: String, team_name: String },
    /// Events owned by other subsystems (project config, summaries, sessions).
    Collaboration { team_id: String, event: Event },
}

impl SyncNotice {
    pub fn team_id(&self) -> &str {
        match self {
            SyncNotice::SkillChanged { team_id, .. }
            | SyncNotice::SkillRemoved { team_id, .. }
            | SyncNotice::MemberJoined { team_id, .. }
            | SyncNotice::MemberLeft { team_id, .. }
            | SyncNotice::TeamDissolved { team_id, .. }
            | SyncNotice::Collaboration { team_id, .. } => team_id,
        }
    }
}

pub trait SyncObserver: Send + Sync {
    fn notify(&self, notice: &SyncNotice);
}

/// Forwards notices into a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncNotice>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SyncNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn notify(&self, notice: &SyncNotice) {
        let _ = self.tx.send(notice.clone());
    }
}

/// Applies leader events to the local mirror and keeps it fresh.
pub struct SyncEngine {
    directory: Arc<TeamDirectory>,
    indexes: Arc<IndexRegistry>,
    client: LeaderClient,
    observers: RwLock<Vec<Arc<dyn SyncObserver>>>,
    team_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    me: Weak<SyncEngine>,
}

impl SyncEngine {
    pub fn new(
        directory: Arc<TeamDirectory>,
        indexes: Arc<IndexRegistry>,
        client: LeaderClient,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            directory,
            indexes,
            client,
            observers: RwLock::new(Vec::new()),
            team_guards: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        if let Ok(mut list) = self.observers.write() {
            list.push(observer);
        }
    }

    fn notify(&self, notice: SyncNotice) {
        let observers: Vec<Arc<dyn SyncObserver>> = self
            .observers
            .read()
            .map(|l| l.clone())
            .unwrap_or_default();
        for observer in observers {
            observer.notify(&notice);
        }
    }

    fn team_guard(&self, team_id: &str) -> Arc<Mutex<()>> {
        self.team_guards
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(team_id.to_string())
            .or_default()
            .clone()
    }

    fn refresh_skill_count(&self, team_id: &str) {
        let count = self.indexes.get_or_open(team_id).len();
        let _ = self.directory.update(team_id, |t| t.skill_count = count);
    }

    /// Applies one inbound event. Bad payloads are logged and dropped.
    pub fn handle_event(&self, team_id: &str, event: Event) {
        let body = match event.decode() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(team_id, kind = %event.kind, error = %e, "Dropping undecodable event");
                return;
            }
        };

        let guard = self.team_guard(team_id);
        let _serial = guard.lock().unwrap_or_else(|p| p.into_inner());

        // late frames for a team already left or dissolved
        if self.directory.get(team_id).is_none() {
            tracing::debug!(team_id, kind = %event.kind, "Event for unknown team ignored");
            return;
        }

        match body {
            EventBody::SkillPublished(entry) => {
                let index = self.indexes.get_or_open(team_id);
                if let Err(e) = index.upsert(entry.clone()) {
                    tracing::warn!(team_id, error = %e, "Failed to store published skill");
                    return;
                }
                self.refresh_skill_count(team_id);
                tracing::info!(team_id, plugin_id = %entry.plugin_id, version = %entry.version, "Skill published");
                self.notify(SyncNotice::SkillChanged {
                    team_id: team_id.to_string(),
                    entry,
                });
            }
            EventBody::SkillUpdated(update) => {
                let index = self.indexes.get_or_open(team_id);
                match index.update_version(&update.plugin_id, &update.version, &update.checksum) {
                    Ok(true) => {
                        if let Some(entry) = index.get(&update.plugin_id) {
                            tracing::info!(team_id, plugin_id = %update.plugin_id, version = %update.version, "Skill updated");
                            self.notify(SyncNotice::SkillChanged {
                                team_id: team_id.to_string(),
                                entry,
                            });
                        }
                    }
                    Ok(false) => {
                        tracing::debug!(team_id, plugin_id = %update.plugin_id, "Update for unknown skill ignored");
                    }
                    Err(e) => tracing::warn!(team_id, error = %e, "Failed to store skill update"),
                }
            }
            EventBody::SkillDeleted(deleted) => {
                let index = self.indexes.get_or_open(team_id);
                match index.remove(&deleted.plugin_id) {
                    Ok(_) => {
                        self.refresh_skill_count(team_id);
                        self.notify(SyncNotice::SkillRemoved {
                            team_id: team_id.to_string(),
                            plugin_id: deleted.plugin_id,
                        });
                    }
                    Err(e) => tracing::warn!(team_id, error = %e, "Failed to remove skill"),
                }
            }
            EventBody::MemberJoined(joined) => {
                let added = self.directory.roster(team_id).add(TeamMember {
                    id: joined.member_id.clone(),
                    name: joined.member_name.clone(),
                    endpoint: joined.endpoint.clone(),
                    is_leader: false,
                    is_online: false,
                    joined_at: joined.joined_at,
                });
                // a repeated announcement must not inflate the count
                if added.is_ok() {
                    let _ = self.directory.update(team_id, |t| t.member_count += 1);
                }
                tracing::info!(team_id, member = %joined.member_name, "Member joined");
                self.notify(SyncNotice::MemberJoined {
                    team_id: team_id.to_string(),
                    member_id: joined.member_id,
                    member_name: joined.member_name,
                });
            }
            EventBody::MemberLeft(left) => {
                let _ = self
                    .directory
                    .update(team_id, |t| t.member_count = t.member_count.saturating_sub(1));
                self.directory.roster(team_id).remove(&left.member_id);
                tracing::info!(team_id, member = %left.member_name, "Member left");
                self.notify(SyncNotice::MemberLeft {
                    team_id: team_id.to_string(),
                    member_id: left.member_id,
                    member_name: left.member_name,
                });
            }
            EventBody::MemberOnline(status) | EventBody::MemberOffline(status) => {
                tracing::debug!(team_id, member = %status.member_name, online = status.is_online, "Member status");
            }
            EventBody::TeamDissolved(dissolved) => {
                self.directory.remove(team_id);
                self.indexes.remove(team_id);
                tracing::info!(team_id, by = %dissolved.dissolved_by, "Team dissolved by leader");
                self.notify(SyncNotice::TeamDissolved {
                    team_id: team_id.to_string(),
                    team_name: dissolved.team_name,
                });
            }
            EventBody::ProjectConfigUpdated(_)
            | EventBody::DailySummaryShared(_)
            | EventBody::MemberStatusChanged(_)
            | EventBody::Opaque(..) => {
                self.notify(SyncNotice::Collaboration {
                    team_id: team_id.to_string(),
                    event,
                });
            }
            EventBody::Auth(_) | EventBody::AuthResult(_) | EventBody::Ping | EventBody::Pong => {
                tracing::debug!(team_id, kind = %event.kind, "Control frame outside handshake ignored");
            }
            EventBody::Unknown(name) => {
                tracing::debug!(team_id, kind = %name, "Ignoring unknown event type");
            }
        }
    }

    /// Pulls the full capability index from the leader of `team_id`.
    pub async fn sync_capability_index(&self, team_id: &str) -> Result<()> {
        let team = self.directory.require(team_id)?;
        if team.is_leader {
            return Ok(());
        }

        let remote = match self.client.skills(&team.leader_endpoint, team_id).await {
            Ok(remote) => remote,
            Err(e) => {
                if e.is_unreachable() {
                    let _ = self.directory.set_leader_online(team_id, false);
                }
                return Err(e);
            }
        };

        {
            let guard = self.team_guard(team_id);
            let _serial = guard.lock().unwrap_or_else(|p| p.into_inner());
            self.indexes.get_or_open(team_id).replace_all(remote.skills)?;
        }
        self.refresh_skill_count(team_id);
        self.directory.update(team_id, |t| {
            t.leader_online = true;
            t.last_sync_at = Some(chrono::Utc::now());
        })?;
        tracing::debug!(team_id, "Capability index synced");
        Ok(())
    }

    /// Syncs every team this peer is a plain member of. One failing leader
    /// does not stop the others.
    pub async fn sync_all(&self) {
        for team in self.directory.list().into_iter().filter(|t| !t.is_leader) {
            if let Err(e) = self.sync_capability_index(&team.id).await {
                tracing::warn!(team_id = %team.id, error = %e, "Periodic sync failed");
            }
        }
    }

    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => engine.sync_all().await,
                }
            }
        })
    }
}

impl EventListener for SyncEngine {
    fn on_event(&self, team_id: &str, event: Event) {
        self.handle_event(team_id, event);
    }

    fn on_connect(&self, team_id: &str) {
        match self.directory.set_leader_online(team_id, true) {
            Ok(_) | Err(TeamError::TeamNotFound(_)) => {}
            Err(e) => tracing::warn!(team_id, error = %e, "Failed to mark leader online"),
        }
        let Some(engine) = self.me.upgrade() else { return };
        let team = team_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(SYNC_AFTER_CONNECT_TIMEOUT, engine.sync_capability_index(&team)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(team_id = %team, error = %e, "Sync after connect failed"),
                Err(_) => tracing::warn!(team_id = %team, "Sync after connect timed out"),
            }
        });
    }

    fn on_disconnect(&self, team_id: &str) {
        let _ = self.directory.set_leader_online(team_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::team;
    use crate::index::tests::entry;
    use crate::protocol::{
        EventType, MemberJoinedPayload, MemberLeftPayload, SkillDeletedPayload,
        SkillUpdatedPayload, TeamDissolvedPayload,
    };
    use crate::storage::DataDir;
    use chrono::Utc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> (Arc<SyncEngine>, Arc<TeamDirectory>, Arc<IndexRegistry>) {
        let data = DataDir::new(dir.path());
        let directory = Arc::new(TeamDirectory::open(data.clone()));
        let indexes = Arc::new(IndexRegistry::new(data));
        let client = LeaderClient::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let engine = SyncEngine::new(directory.clone(), indexes.clone(), client);
        (engine, directory, indexes)
    }

    #[test]
    fn skill_events_maintain_the_mirror() {
        let dir = TempDir::new().unwrap();
        let (engine, directory, indexes) = engine(&dir);
        directory.add(team("t", false)).unwrap();
        let (observer, mut notices) = ChannelObserver::new();
        engine.add_observer(observer);

        let published = entry("skill-1", "1.0.0");
        engine.handle_event("t", Event::new(EventType::SkillPublished, "t", &published).unwrap());
        assert_eq!(indexes.get_or_open("t").get("skill-1").unwrap().version, "1.0.0");
        assert_eq!(directory.get("t").unwrap().skill_count, 1);

        let update = SkillUpdatedPayload {
            plugin_id: "skill-1".into(),
            version: "2.0.0".into(),
            checksum: "new".into(),
            updated_at: Utc::now(),
        };
        engine.handle_event("t", Event::new(EventType::SkillUpdated, "t", &update).unwrap());
        let stored = indexes.get_or_open("t").get("skill-1").unwrap();
        assert_eq!(stored.version, "2.0.0");
        assert_eq!(stored.name, published.name);

        let deleted = SkillDeletedPayload {
            plugin_id: "skill-1".into(),
            deleted_by: "leader".into(),
            deleted_at: Utc::now(),
        };
        engine.handle_event("t", Event::new(EventType::SkillDeleted, "t", &deleted).unwrap());
        assert!(indexes.get_or_open("t").is_empty());
        assert_eq!(directory.get("t").unwrap().skill_count, 0);

        let kinds: Vec<_> = std::iter::from_fn(|| notices.try_recv().ok()).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(&kinds[1], SyncNotice::SkillChanged { entry, .. } if entry.version == "2.0.0"));
        assert!(matches!(&kinds[2], SyncNotice::SkillRemoved { plugin_id, .. } if plugin_id == "skill-1"));
    }

    #[test]
    fn member_count_never_goes_negative() {
        let dir = TempDir::new().unwrap();
        let (engine, directory, _) = engine(&dir);
        directory.add(team("t", false)).unwrap();

        let joined = MemberJoinedPayload {
            member_id: "m2".into(),
            member_name: "carol".into(),
            endpoint: "10.0.0.3:19960".into(),
            joined_at: Utc::now(),
        };
        engine.handle_event("t", Event::new(EventType::MemberJoined, "t", &joined).unwrap());
        assert_eq!(directory.get("t").unwrap().member_count, 2);
        assert!(directory.roster("t").exists("m2"));

        let left = MemberLeftPayload {
            member_id: "m2".into(),
            member_name: "carol".into(),
            left_at: Utc::now(),
        };
        for _ in 0..3 {
            engine.handle_event("t", Event::new(EventType::MemberLeft, "t", &left).unwrap());
        }
        assert_eq!(directory.get("t").unwrap().member_count, 0);
    }

    #[test]
    fn dissolution_drops_team_and_mirror() {
        let dir = TempDir::new().unwrap();
        let (engine, directory, indexes) = engine(&dir);
        directory.add(team("t", false)).unwrap();
        indexes.get_or_open("t").upsert(entry("a", "1")).unwrap();
        let (observer, mut notices) = ChannelObserver::new();
        engine.add_observer(observer);

        let payload = TeamDissolvedPayload {
            team_id: "t".into(),
            team_name: "team t".into(),
            dissolved_by: "leader".into(),
            dissolved_at: Utc::now(),
        };
        engine.handle_event("t", Event::new(EventType::TeamDissolved, "t", &payload).unwrap());
        assert!(directory.get("t").is_none());
        assert!(indexes.get("t").is_none());
        assert!(matches!(notices.try_recv().unwrap(), SyncNotice::TeamDissolved { .. }));
    }

    #[test]
    fn unknown_and_malformed_events_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (engine, directory, _) = engine(&dir);
        directory.add(team("t", false)).unwrap();
        let (observer, mut notices) = ChannelObserver::new();
        engine.add_observer(observer);

        engine.handle_event("t", Event::from_json(r#"{"type":"future_thing","team_id":"t"}"#).unwrap());
        engine.handle_event("t", Event::from_json(r#"{"type":"skill_published","team_id":"t","payload":{"bogus":true}}"#).unwrap());
        assert!(notices.try_recv().is_err());
        assert_eq!(directory.get("t").unwrap().skill_count, 0);
    }

    #[tokio::test]
    async fn leader_teams_are_not_synced_and_dead_leader_goes_offline() {
        let dir = TempDir::new().unwrap();
        let (engine, directory, _) = engine(&dir);
        directory.add(team("mine", true)).unwrap();
        engine.sync_capability_index("mine").await.unwrap();

        let mut theirs = team("theirs", false);
        theirs.leader_endpoint = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        directory.add(theirs).unwrap();
        assert!(engine.sync_capability_index("theirs").await.is_err());
        assert!(!directory.get("theirs").unwrap().leader_online);

        // periodic pass logs and carries on
        engine.sync_all().await;
        assert!(matches!(
            engine.sync_capability_index("nope").await,
            Err(TeamError::TeamNotFound(_))
        ));
    }
}
