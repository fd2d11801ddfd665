use axum::{
    extract::{Extension, Path, State},
    Json,
};
use labsync_common::types::PresenceEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiState;
use crate::{auth::middleware::AuthenticatedUser, error::RelayError};

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub lab_id: Uuid,
    pub presence: Vec<PresenceEntry>,
}

pub(super) async fn get_presence(
    Path(lab_id): Path<Uuid>,
    Extension(user): Extension<AuthenticatedUser>,
    State(state): State<ApiState>,
) -> Result<Json<PresenceResponse>, RelayError> {
    let presence = state.hub.get_presence(lab_id, user.user_id).await?;
    Ok(Json(PresenceResponse { lab_id, presence }))
}
