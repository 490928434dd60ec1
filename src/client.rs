use crate::archive;
use crate::error::{Result, TeamError};
use crate::index::{SkillEntry, TeamSkillIndex};
use crate::peer::{Team, TeamMember};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Percent-encodes one URL path segment.
pub fn path_segment(s: &str) -> String {
    utf8_percent_encode(s, SEGMENT).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamInfoResponse {
    pub team: Team,
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member_id: String,
    pub member_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    #[serde(default)]
    pub members: Vec<TeamMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_index: Option<TeamSkillIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JoinResponse {
    pub fn rejected(reason: &str) -> Self {
        Self {
            success: false,
            error: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillMeta {
    pub plugin_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub files: Vec<String>,
    pub total_size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub member_id: String,
    pub member_name: String,
    pub teams: usize,
}

/// HTTP calls from one peer to another (usually a member to its leader).
#[derive(Clone)]
pub struct LeaderClient {
    http: reqwest::Client,
    downloads: reqwest::Client,
}

impl LeaderClient {
    pub fn new(request_timeout: Duration, download_timeout: Duration) -> Result<Self> {
        Ok(Self {
            // peers are on the LAN; never route them through a proxy
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .no_proxy()
                .build()?,
            downloads: reqwest::Client::builder()
                .timeout(download_timeout)
                .no_proxy()
                .build()?,
        })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("http://{}{}", endpoint, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TeamError::RemoteStatus {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> Result<T> {
        let resp = self.http.get(Self::url(endpoint, path)).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .http
            .post(Self::url(endpoint, path))
            .json(body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn team_info(&self, endpoint: &str) -> Result<TeamInfoResponse> {
        self.get_json(endpoint, "/team/info").await
    }

    pub async fn join(&self, endpoint: &str, team_id: &str, req: &JoinRequest) -> Result<JoinResponse> {
        let path = format!("/team/{}/join", path_segment(team_id));
        self.post_json(endpoint, &path, req).await
    }

    pub async fn leave(&self, endpoint: &str, team_id: &str, member_id: &str) -> Result<()> {
        let path = format!("/team/{}/leave", path_segment(team_id));
        let _: serde_json::Value = self
            .post_json(
                endpoint,
                &path,
                &LeaveRequest {
                    member_id: member_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn members(&self, endpoint: &str, team_id: &str) -> Result<Vec<TeamMember>> {
        let path = format!("/team/{}/members", path_segment(team_id));
        self.get_json(endpoint, &path).await
    }

    pub async fn skills(&self, endpoint: &str, team_id: &str) -> Result<TeamSkillIndex> {
        let path = format!("/team/{}/skills", path_segment(team_id));
        self.get_json(endpoint, &path).await
    }

    /// Asks the leader to publish an entry.
    pub async fn publish_skill(&self, endpoint: &str, team_id: &str, entry: &SkillEntry) -> Result<()> {
        let path = format!("/team/{}/skills", path_segment(team_id));
        let _: serde_json::Value = self.post_json(endpoint, &path, entry).await?;
        Ok(())
    }

    pub async fn unpublish_skill(&self, endpoint: &str, team_id: &str, plugin_id: &str) -> Result<()> {
        let path = format!(
            "/team/{}/skills/{}",
            path_segment(team_id),
            path_segment(plugin_id)
        );
        let resp = self.http.delete(Self::url(endpoint, &path)).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn health(&self, endpoint: &str) -> Result<HealthResponse> {
        self.get_json(endpoint, "/p2p/health").await
    }

    pub async fn skill_meta(&self, endpoint: &str, plugin_id: &str) -> Result<SkillMeta> {
        let path = format!("/p2p/skills/{}/meta", path_segment(plugin_id));
        self.get_json(endpoint, &path).await
    }

    pub async fn download_skill(&self, endpoint: &str, plugin_id: &str) -> Result<Vec<u8>> {
        let path = format!("/p2p/skills/{}/download", path_segment(plugin_id));
        let resp = self.downloads.get(Self::url(endpoint, &path)).send().await?;
        let bytes = Self::check(resp).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Downloads a capability, checks it against the advertised checksum,
    /// then unpacks it into `dest`.
    pub async fn fetch_skill(&self, endpoint: &str, plugin_id: &str, dest: &Path) -> Result<SkillMeta> {
        let meta = self.skill_meta(endpoint, plugin_id).await?;
        let bytes = self.download_skill(endpoint, plugin_id).await?;
        archive::ensure_checksum(&bytes, &meta.checksum)?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || archive::unpack(&bytes, &dest))
            .await
            .map_err(|e| TeamError::Io(std::io::Error::other(e.to_string())))??;

        tracing::info!(%endpoint, %plugin_id, version = %meta.version, "Fetched capability");
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_escaped() {
        assert_eq!(path_segment("team-1_a.b"), "team-1_a.b");
        assert_eq!(path_segment("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn rejected_join_has_reason_and_no_team() {
        let resp = JoinResponse::rejected("not the leader of this team");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "not the leader of this team");
        assert!(json.get("team").is_none());
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_http_error() {
        let dead = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        let client = LeaderClient::new(Duration::from_secs(2), Duration::from_secs(2)).unwrap();
        let err = client.team_info(&dead).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
