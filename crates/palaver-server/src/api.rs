use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use palaver_broker::Broker;
use palaver_cache::ConversationCache;
use palaver_shared::constants::WS_PATH;
use palaver_shared::ids::{ConversationKey, GroupId, UserId};
use palaver_shared::message::ChatMessage;
use palaver_store::models::{Group, User};
use palaver_store::{Repository, SqliteRepository, StoreError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub repository: Arc<SqliteRepository>,
    pub cache: Arc<ConversationCache>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(WS_PATH, get(ws::ws_handler))
        .route("/conversations/:key/recent", get(conversation_recent))
        .route("/admin/groups", post(admin_create_group))
        .route("/admin/groups/:id/members", post(admin_add_member))
        .route("/admin/groups/:id/members/:user", delete(admin_remove_member))
        .route("/admin/users", post(admin_upsert_user))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the listener fails or the process shuts down.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct RecentResponse {
    messages: Vec<ChatMessage>,
    cached: bool,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    owner: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Serialize)]
struct CreateGroupResponse {
    id: GroupId,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user: String,
}

#[derive(Deserialize)]
struct UpsertUserRequest {
    id: Option<String>,
    display_name: String,
    avatar: Option<String>,
}

#[derive(Serialize)]
struct UpsertUserResponse {
    id: UserId,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Read-through conversation history for reconnecting clients: cached
/// tail when warm, repository otherwise (repopulating asynchronously).
async fn conversation_recent(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RecentResponse>, ServerError> {
    let key = ConversationKey::from_raw(&key);

    if let Some(messages) = state.cache.recent(&key).await {
        return Ok(Json(RecentResponse {
            messages,
            cached: true,
        }));
    }

    let messages = state
        .repository
        .recent_messages(&key, state.config.conversation_tail)
        .await?;
    if !messages.is_empty() {
        state.cache.store_recent(&key, messages.clone()).await;
    }
    Ok(Json(RecentResponse {
        messages,
        cached: false,
    }))
}

/// Create a group with its initial membership in one transaction.  The
/// owner is always a member.
async fn admin_create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Json<CreateGroupResponse>, ServerError> {
    let owner = UserId::parse(&request.owner)
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let mut members = vec![owner.clone()];
    for raw in &request.members {
        let member =
            UserId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))?;
        if !members.contains(&member) {
            members.push(member);
        }
    }

    let group = Group {
        id: GroupId::generate(),
        name: request.name,
        owner_id: owner,
        created_at: Utc::now(),
    };
    let id = group.id.clone();

    state
        .repository
        .create_group_with_members(group, members)
        .await?;

    info!(group = %id, "group created");
    Ok(Json(CreateGroupResponse { id }))
}

/// Add a member to an existing group.  The cached membership set is
/// invalidated so the next group send re-reads the roster.
async fn admin_add_member(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<StatusCode, ServerError> {
    let group =
        GroupId::parse(&id).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let user = UserId::parse(&request.user)
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    // Surface a clean 404 rather than a foreign-key failure.
    state.repository.get_group(group.clone()).await?;
    state
        .repository
        .add_group_member(group.clone(), user.clone())
        .await?;
    state.cache.forget_group_members(&group).await;

    info!(group = %group, user = %user, "group member added");
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_remove_member(
    State(state): State<AppState>,
    Path((id, user)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let group =
        GroupId::parse(&id).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let user =
        UserId::parse(&user).map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let removed = state
        .repository
        .remove_group_member(group.clone(), user.clone())
        .await?;
    state.cache.forget_group_members(&group).await;
    if !removed {
        return Err(ServerError::Storage(StoreError::NotFound));
    }

    info!(group = %group, user = %user, "group member removed");
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_upsert_user(
    State(state): State<AppState>,
    Json(request): Json<UpsertUserRequest>,
) -> Result<Json<UpsertUserResponse>, ServerError> {
    let id = match &request.id {
        Some(raw) => {
            UserId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))?
        }
        None => UserId::generate(),
    };

    let user = User {
        id: id.clone(),
        display_name: request.display_name,
        avatar: request
            .avatar
            .as_deref()
            .map(palaver_shared::message::normalize_avatar_ref),
        created_at: Utc::now(),
    };
    state.repository.upsert_user(user).await?;

    Ok(Json(UpsertUserResponse { id }))
}
