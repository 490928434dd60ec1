//! HTTP surface every peer serves on its node port.
//!
//! - GET    /team/info, /team/{id}/info
//! - POST   /team/{id}/join, /team/{id}/leave
//! - GET    /team/{id}/members
//! - GET    /team/{id}/skills, POST /team/{id}/skills
//! - DELETE /team/{id}/skills/{plugin_id}
//! - GET    /team/{id}/ws (WebSocket upgrade)
//! - GET    /p2p/health
//! - GET    /p2p/skills/{id}/meta, /p2p/skills/{id}/download

use crate::client::{HealthResponse, JoinRequest, JoinResponse, LeaveRequest, SkillMeta, TeamInfoResponse};
use crate::error::TeamError;
use crate::index::{CapabilityIndexStore, SkillEntry, TeamSkillIndex};
use crate::peer::TeamMember;
use crate::state::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{json, Value};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/team/info", get(leader_team_info))
        .route("/team/{id}/info", get(team_info))
        .route("/team/{id}/join", post(join))
        .route("/team/{id}/leave", post(leave))
        .route("/team/{id}/members", get(members))
        .route("/team/{id}/skills", get(list_skills).post(publish_skill))
        .route("/team/{id}/skills/{plugin_id}", delete(delete_skill))
        .route("/team/{id}/ws", get(team_socket))
        .route("/p2p/health", get(health))
        .route("/p2p/skills/{id}/meta", get(skill_meta))
        .route("/p2p/skills/{id}/download", get(download_skill))
        .with_state(state)
}

/// JSON `{"error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_leader() -> Self {
        Self::new(StatusCode::FORBIDDEN, "not the leader of this team")
    }
}

impl From<TeamError> for ApiError {
    fn from(e: TeamError) -> Self {
        let status = match &e {
            TeamError::TeamNotFound(_) | TeamError::MemberNotFound(_) | TeamError::SkillNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            TeamError::NotTeamLeader => StatusCode::FORBIDDEN,
            TeamError::PathTraversal(_) | TeamError::MalformedPayload(_) | TeamError::InvalidEndpoint(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn info_for(state: &AppState, team_id: &str) -> ApiResult<Json<TeamInfoResponse>> {
    let team = state
        .directory
        .get(team_id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "team not found"))?;
    let members = state.directory.roster(team_id).list();
    Ok(Json(TeamInfoResponse { team, members }))
}

async fn leader_team_info(State(state): State<AppState>) -> ApiResult<Json<TeamInfoResponse>> {
    let team = state
        .directory
        .leader_team()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not a team leader"))?;
    info_for(&state, &team.id)
}

async fn team_info(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
) -> ApiResult<Json<TeamInfoResponse>> {
    info_for(&state, &team_id)
}

async fn join(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> Json<JoinResponse> {
    Json(state.coordinator.handle_join_request(&team_id, req))
}

async fn leave(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    Json(req): Json<LeaveRequest>,
) -> ApiResult<Json<Value>> {
    state
        .coordinator
        .handle_leave_request(&team_id, &req.member_id)?;
    Ok(Json(json!({ "success": true })))
}

async fn members(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
) -> ApiResult<Json<Vec<TeamMember>>> {
    state.directory.require(&team_id)?;
    Ok(Json(state.directory.roster(&team_id).list()))
}

async fn list_skills(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
) -> ApiResult<Json<TeamSkillIndex>> {
    state
        .directory
        .require(&team_id)
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "skill index not found"))?;
    Ok(Json(state.indexes.get_or_open(&team_id).snapshot()))
}

async fn publish_skill(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    Json(entry): Json<SkillEntry>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if !state.directory.is_leader_of(&team_id) {
        return Err(ApiError::not_leader());
    }
    if entry.plugin_id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid skill entry"));
    }
    let entry = state.coordinator.publish_capability(&team_id, entry)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "entry": entry })),
    ))
}

async fn delete_skill(
    State(state): State<AppState>,
    Path((team_id, plugin_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    if !state.directory.is_leader_of(&team_id) {
        return Err(ApiError::not_leader());
    }
    let deleted_by = state
        .indexes
        .get_or_open(&team_id)
        .get(&plugin_id)
        .map(|e| e.author_name)
        .unwrap_or_default();
    state
        .coordinator
        .remove_capability(&team_id, &plugin_id, &deleted_by)?;
    Ok(Json(json!({ "success": true })))
}

async fn team_socket(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    let limit = hub.config().max_frame_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| hub.serve(socket, team_id))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let identity = state.identity.get();
    Json(HealthResponse {
        status: "online".into(),
        member_id: identity.as_ref().map(|i| i.id.clone()).unwrap_or_default(),
        member_name: identity.map(|i| i.name).unwrap_or_default(),
        teams: state.directory.list().len(),
    })
}

async fn skill_meta(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> ApiResult<Json<SkillMeta>> {
    let skills = state.skills.clone();
    let meta = tokio::task::spawn_blocking(move || skills.meta(&plugin_id))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(meta))
}

async fn download_skill(
    State(state): State<AppState>,
    Path(plugin_id): Path<String>,
) -> ApiResult<Response> {
    let skills = state.skills.clone();
    let id = plugin_id.clone();
    let (bytes, _) = tokio::task::spawn_blocking(move || skills.package(&id))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={plugin_id}.tar.gz"),
        ),
    ];
    Ok((headers, bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::discovery::MemoryAdvertiser;
    use crate::index::tests::entry;
    use crate::network::StaticInterfaces;
    use crate::{NodeOptions, Services};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn services(dir: &TempDir) -> Services {
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };
        let options = NodeOptions {
            interfaces: Arc::new(StaticInterfaces::single("eth0", Ipv4Addr::new(10, 1, 2, 3))),
            advertiser: Some(Arc::new(MemoryAdvertiser::new())),
        };
        Services::build(&config, 19960, options).unwrap()
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn team_info_requires_a_led_team() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);
        let router = build_router(services.app_state());

        let (status, body) = call(router.clone(), Request::get("/team/info").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not a team leader");

        services.coordinator.set_identity("alice").unwrap();
        let team = services.coordinator.create_team("core", "", "").await.unwrap();
        let (status, body) = call(router, Request::get("/team/info").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["team"]["id"], team.id.as_str());
        assert_eq!(body["members"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn join_and_leave_round_trip_through_http() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);
        services.coordinator.set_identity("alice").unwrap();
        let team = services.coordinator.create_team("core", "", "").await.unwrap();
        let router = build_router(services.app_state());

        let req = JoinRequest {
            member_id: "m-1".into(),
            member_name: "bob".into(),
            endpoint: "10.1.2.4:19960".into(),
        };
        let (status, body) = call(router.clone(), post_json(&format!("/team/{}/join", team.id), &req)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["members"].as_array().unwrap().len(), 2);
        assert_eq!(body["team"]["member_count"], 2);

        let (_, body) = call(router.clone(), post_json("/team/unknown/join", &req)).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "not the leader of this team");

        let leave = LeaveRequest { member_id: "m-1".into() };
        let (status, _) = call(router.clone(), post_json(&format!("/team/{}/leave", team.id), &leave)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, members) = call(
            router,
            Request::get(format!("/team/{}/members", team.id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(members.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skill_publication_is_leader_only() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);
        services.coordinator.set_identity("alice").unwrap();
        let team = services.coordinator.create_team("core", "", "").await.unwrap();
        services
            .directory
            .add(crate::directory::tests::team("other", false))
            .unwrap();
        let router = build_router(services.app_state());

        let skill = entry("skill-1", "1.0.0");
        let (status, _) = call(router.clone(), post_json("/team/other/skills", &skill)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(router.clone(), post_json(&format!("/team/{}/skills", team.id), &skill)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["entry"]["plugin_id"], "skill-1");

        let (_, index) = call(
            router.clone(),
            Request::get(format!("/team/{}/skills", team.id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(index["skills"].as_array().unwrap().len(), 1);

        let uri = format!("/team/{}/skills/skill-1", team.id);
        let (status, _) = call(router.clone(), Request::delete(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router, Request::delete(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_skill_download() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);
        services.coordinator.set_identity("alice").unwrap();
        let skill_dir = services.skills.root().join("fmt");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("main.md"), "# fmt").unwrap();
        let router = build_router(services.app_state());

        let (status, body) = call(router.clone(), Request::get("/p2p/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");
        assert_eq!(body["member_name"], "alice");

        let (_, meta) = call(router.clone(), Request::get("/p2p/skills/fmt/meta").body(Body::empty()).unwrap()).await;
        assert_eq!(meta["files"][0], "main.md");

        let resp = router
            .clone()
            .oneshot(Request::get("/p2p/skills/fmt/download").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/gzip");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(crate::archive::verify_checksum(&bytes, meta["checksum"].as_str().unwrap()));

        let (status, _) = call(router, Request::get("/p2p/skills/missing/meta").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
