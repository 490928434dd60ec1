use crate::coordinator::TeamCoordinator;
use crate::directory::TeamDirectory;
use crate::hub::LeaderHub;
use crate::index::IndexRegistry;
use crate::skills::SkillProvider;
use crate::storage::IdentityStore;
use std::sync::Arc;

/// Shared handles behind every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TeamCoordinator>,
    pub directory: Arc<TeamDirectory>,
    pub indexes: Arc<IndexRegistry>,
    pub hub: Arc<LeaderHub>,
    pub identity: Arc<IdentityStore>,
    pub skills: SkillProvider,
}
