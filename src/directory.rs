use crate::error::{Result, TeamError};
use crate::peer::{Team, TeamMember};
use crate::storage::{load_json, save_json, DataDir};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Member list of one team. Authoritative on the leader, a cache elsewhere.
pub struct Roster {
    team_id: String,
    path: PathBuf,
    members: RwLock<HashMap<String, TeamMember>>,
}

impl Roster {
    fn open(team_id: &str, path: PathBuf) -> Self {
        let stored: Vec<TeamMember> = load_json(&path);
        let members = stored
            .into_iter()
            .map(|mut m| {
                // nobody is connected right after a restart
                if !m.is_leader {
                    m.is_online = false;
                }
                (m.id.clone(), m)
            })
            .collect();
        Self {
            team_id: team_id.to_string(),
            path,
            members: RwLock::new(members),
        }
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    fn persist(&self, members: &HashMap<String, TeamMember>) {
        let list = sorted(members.values().cloned().collect());
        if let Err(e) = save_json(&self.path, &list) {
            tracing::warn!(team_id = %self.team_id, error = %e, "Failed to save roster");
        }
    }

    pub fn add_leader(&self, id: &str, name: &str, endpoint: &str) -> TeamMember {
        let member = TeamMember {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            is_leader: true,
            is_online: true,
            joined_at: Utc::now(),
        };
        let mut members = write(&self.members);
        members.insert(member.id.clone(), member.clone());
        self.persist(&members);
        member
    }

    pub fn add(&self, member: TeamMember) -> Result<()> {
        let mut members = write(&self.members);
        if members.contains_key(&member.id) {
            return Err(TeamError::AlreadyTeamMember(member.id));
        }
        members.insert(member.id.clone(), member);
        self.persist(&members);
        Ok(())
    }

    /// Returns the removed member, `None` if it was unknown.
    pub fn remove(&self, member_id: &str) -> Option<TeamMember> {
        let mut members = write(&self.members);
        let removed = members.remove(member_id);
        if removed.is_some() {
            self.persist(&members);
        }
        removed
    }

    pub fn get(&self, member_id: &str) -> Option<TeamMember> {
        read(&self.members).get(member_id).cloned()
    }

    pub fn exists(&self, member_id: &str) -> bool {
        read(&self.members).contains_key(member_id)
    }

    pub fn update_endpoint(&self, member_id: &str, endpoint: &str) -> Result<()> {
        let mut members = write(&self.members);
        let member = members
            .get_mut(member_id)
            .ok_or_else(|| TeamError::MemberNotFound(member_id.to_string()))?;
        member.endpoint = endpoint.to_string();
        self.persist(&members);
        Ok(())
    }

    pub fn set_online(&self, member_id: &str, online: bool) -> Option<TeamMember> {
        let mut members = write(&self.members);
        let member = members.get_mut(member_id)?;
        member.is_online = online;
        let updated = member.clone();
        self.persist(&members);
        Some(updated)
    }

    /// Replaces the cached list with a fresh copy from the leader.
    pub fn replace_all(&self, list: Vec<TeamMember>) {
        let mut members = write(&self.members);
        *members = list.into_iter().map(|m| (m.id.clone(), m)).collect();
        self.persist(&members);
    }

    /// Leader first, then by join time.
    pub fn list(&self) -> Vec<TeamMember> {
        sorted(read(&self.members).values().cloned().collect())
    }

    pub fn count(&self) -> usize {
        read(&self.members).len()
    }
}

fn sorted(mut members: Vec<TeamMember>) -> Vec<TeamMember> {
    members.sort_by(|a, b| {
        b.is_leader
            .cmp(&a.is_leader)
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    members
}

/// Every team this peer belongs to, plus rosters opened on demand.
pub struct TeamDirectory {
    data: DataDir,
    teams: RwLock<HashMap<String, Team>>,
    rosters: RwLock<HashMap<String, Arc<Roster>>>,
}

impl TeamDirectory {
    pub fn open(data: DataDir) -> Self {
        let stored: Vec<Team> = load_json(&data.teams_path());
        let teams = stored.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            data,
            teams: RwLock::new(teams),
            rosters: RwLock::new(HashMap::new()),
        }
    }

    fn persist(&self, teams: &HashMap<String, Team>) {
        let list: Vec<&Team> = teams.values().collect();
        if let Err(e) = save_json(&self.data.teams_path(), &list) {
            tracing::warn!(error = %e, "Failed to save teams");
        }
    }

    pub fn get(&self, team_id: &str) -> Option<Team> {
        read(&self.teams).get(team_id).cloned()
    }

    pub fn require(&self, team_id: &str) -> Result<Team> {
        self.get(team_id)
            .ok_or_else(|| TeamError::TeamNotFound(team_id.to_string()))
    }

    /// Leader team first, then most recently joined.
    pub fn list(&self) -> Vec<Team> {
        let mut teams: Vec<Team> = read(&self.teams).values().cloned().collect();
        teams.sort_by(|a, b| {
            b.is_leader
                .cmp(&a.is_leader)
                .then_with(|| b.joined_at.cmp(&a.joined_at))
        });
        teams
    }

    pub fn leader_team(&self) -> Option<Team> {
        read(&self.teams).values().find(|t| t.is_leader).cloned()
    }

    pub fn is_leader_of(&self, team_id: &str) -> bool {
        self.get(team_id).map(|t| t.is_leader).unwrap_or(false)
    }

    pub fn add(&self, team: Team) -> Result<()> {
        let mut teams = write(&self.teams);
        if teams.contains_key(&team.id) {
            return Err(TeamError::AlreadyTeamMember(team.id));
        }
        teams.insert(team.id.clone(), team);
        self.persist(&teams);
        Ok(())
    }

    /// Insert or overwrite; `is_leader` of an existing row is kept.
    pub fn upsert(&self, mut team: Team) {
        let mut teams = write(&self.teams);
        if let Some(existing) = teams.get(&team.id) {
            team.is_leader = existing.is_leader;
        }
        teams.insert(team.id.clone(), team);
        self.persist(&teams);
    }

    pub fn update<F>(&self, team_id: &str, f: F) -> Result<Team>
    where
        F: FnOnce(&mut Team),
    {
        let mut teams = write(&self.teams);
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| TeamError::TeamNotFound(team_id.to_string()))?;
        f(team);
        let updated = team.clone();
        self.persist(&teams);
        Ok(updated)
    }

    pub fn set_leader_online(&self, team_id: &str, online: bool) -> Result<Team> {
        self.update(team_id, |t| t.leader_online = online)
    }

    pub fn update_last_sync(&self, team_id: &str) -> Result<Team> {
        self.update(team_id, |t| t.last_sync_at = Some(Utc::now()))
    }

    /// Removes the row, its roster and its directory. Unknown ids are fine.
    pub fn remove(&self, team_id: &str) {
        {
            let mut teams = write(&self.teams);
            if teams.remove(team_id).is_some() {
                self.persist(&teams);
            }
        }
        self.drop_roster(team_id);
        let dir = self.data.team_dir(team_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(team_id, error = %e, "Failed to remove team directory");
            }
        }
    }

    pub fn roster(&self, team_id: &str) -> Arc<Roster> {
        if let Some(r) = read(&self.rosters).get(team_id) {
            return r.clone();
        }
        write(&self.rosters)
            .entry(team_id.to_string())
            .or_insert_with(|| Arc::new(Roster::open(team_id, self.data.members_path(team_id))))
            .clone()
    }

    pub fn drop_roster(&self, team_id: &str) {
        write(&self.rosters).remove(team_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    pub fn team(id: &str, is_leader: bool) -> Team {
        let now = Utc::now();
        Team {
            id: id.into(),
            name: format!("team {id}"),
            leader_id: "leader".into(),
            leader_name: "Leader".into(),
            leader_endpoint: "127.0.0.1:19960".into(),
            member_count: 1,
            skill_count: 0,
            created_at: now,
            joined_at: now,
            is_leader,
            leader_online: true,
            last_sync_at: None,
        }
    }

    fn member(id: &str) -> TeamMember {
        TeamMember {
            id: id.into(),
            name: id.to_uppercase(),
            endpoint: "10.0.0.2:19960".into(),
            is_leader: false,
            is_online: true,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn list_puts_leader_team_first_then_newest() {
        let dir = TempDir::new().unwrap();
        let d = TeamDirectory::open(DataDir::new(dir.path()));
        let mut old = team("old", false);
        old.joined_at = Utc::now() - Duration::days(2);
        d.add(old).unwrap();
        d.add(team("new", false)).unwrap();
        let mut lead = team("mine", true);
        lead.joined_at = Utc::now() - Duration::days(10);
        d.add(lead).unwrap();

        let ids: Vec<_> = d.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["mine", "new", "old"]);
        assert_eq!(d.leader_team().unwrap().id, "mine");
    }

    #[test]
    fn add_twice_is_rejected_and_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let d = TeamDirectory::open(DataDir::new(dir.path()));
        d.add(team("t", false)).unwrap();
        assert!(matches!(d.add(team("t", false)), Err(TeamError::AlreadyTeamMember(_))));

        d.roster("t").add(member("m1")).unwrap();
        assert!(dir.path().join("team/t/members.json").exists());

        d.remove("t");
        d.remove("t");
        assert!(d.get("t").is_none());
        assert!(!dir.path().join("team/t").exists());
    }

    #[test]
    fn upsert_never_flips_leadership() {
        let dir = TempDir::new().unwrap();
        let d = TeamDirectory::open(DataDir::new(dir.path()));
        d.add(team("t", true)).unwrap();
        d.upsert(team("t", false));
        assert!(d.is_leader_of("t"));
    }

    #[test]
    fn roster_reload_marks_members_offline() {
        let dir = TempDir::new().unwrap();
        let data = DataDir::new(dir.path());
        {
            let d = TeamDirectory::open(data.clone());
            d.add(team("t", true)).unwrap();
            let r = d.roster("t");
            r.add_leader("leader", "Leader", "10.0.0.1:19960");
            r.add(member("m1")).unwrap();
        }

        let d = TeamDirectory::open(data);
        let list = d.roster("t").list();
        assert_eq!(list.len(), 2);
        assert!(list[0].is_leader && list[0].is_online);
        assert!(!list[1].is_online);
        assert_eq!(d.get("t").unwrap().name, "team t");
    }

    #[test]
    fn roster_mutations() {
        let dir = TempDir::new().unwrap();
        let d = TeamDirectory::open(DataDir::new(dir.path()));
        let r = d.roster("t");
        r.add(member("m1")).unwrap();
        assert!(matches!(r.add(member("m1")), Err(TeamError::AlreadyTeamMember(_))));

        r.update_endpoint("m1", "10.0.0.9:1").unwrap();
        assert_eq!(r.get("m1").unwrap().endpoint, "10.0.0.9:1");
        assert!(r.update_endpoint("ghost", "x").is_err());

        assert!(!r.set_online("m1", false).unwrap().is_online);
        assert!(r.set_online("ghost", true).is_none());

        assert!(r.remove("m1").is_some());
        assert!(r.remove("m1").is_none());
        assert_eq!(r.count(), 0);
    }
}
