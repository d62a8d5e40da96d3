// Importations de l'état de l'application, des modèles de données, et des composants Axum.
use crate::app_state::AppState;
use crate::database::current_timestamp;
use crate::error::AppError;
use crate::events::RecipeEventKind;
use crate::models::{
    ClearCacheQuery, FavoriteResponse, HealthStatus, LikeResponse, ListRecipesQuery,
    PersonalizedRecipeView, RecipeId, RecipeListResponse, UserId,
};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use tracing::info;

// En-tête portant l'identité de l'utilisateur, posé par la couche d'authentification en amont.
pub const VIEWER_HEADER: &str = "x-user-id";

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

// Extracteur de l'utilisateur courant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(VIEWER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .map(Viewer)
            .ok_or(AppError::MissingViewer)
    }
}

// Handler pour GET `/recipes` : page du fil, personnalisée pour l'utilisateur.
pub async fn list_recipes_handler(
    State(state): State<AppState>,
    Viewer(viewer_id): Viewer,
    Query(params): Query<ListRecipesQuery>,
) -> Result<Json<RecipeListResponse>, AppError> {
    // Bornes de pagination : 1..=100 pour `limit`, >= 0 pour `offset`.
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;
    let offset = params.offset.unwrap_or(0).max(0) as usize;
    let force_refresh = params.force_refresh.unwrap_or(false);

    let page = state
        .service
        .list_recipes(viewer_id, limit, offset, force_refresh)
        .await?;

    // On ne journalise la vue que si elle a nécessité un chargement depuis la base.
    if !page.served_from_cache {
        state.events.record(
            0,
            viewer_id,
            RecipeEventKind::ViewedList,
            serde_json::json!({
                "limit": limit,
                "offset": offset,
                "force_refresh": force_refresh,
            }),
        );
    }

    Ok(Json(RecipeListResponse {
        recipes: page.rows,
        total_count: page.total_count,
        limit,
        offset,
        from_cache: page.served_from_cache,
    }))
}

// Handler pour GET `/recipes/{recipe_id}` : lu directement depuis la base, sans cache.
pub async fn get_recipe_handler(
    State(state): State<AppState>,
    Viewer(viewer_id): Viewer,
    Path(recipe_id): Path<RecipeId>,
) -> Result<Json<PersonalizedRecipeView>, AppError> {
    let recipe = state
        .service
        .store()
        .get_recipe_with_viewer_flags(recipe_id, viewer_id)
        .await?;
    Ok(Json(recipe))
}

// Handler pour POST `/recipes/{recipe_id}/like`.
pub async fn like_handler(
    State(state): State<AppState>,
    Viewer(viewer_id): Viewer,
    Path(recipe_id): Path<RecipeId>,
) -> Result<Json<LikeResponse>, AppError> {
    let is_liked = state.service.toggle_like(recipe_id, viewer_id).await?;

    state.events.record(
        recipe_id,
        viewer_id,
        RecipeEventKind::for_like(is_liked),
        serde_json::json!({
            "previous_state": !is_liked,
            "new_state": is_liked,
        }),
    );

    Ok(Json(LikeResponse {
        recipe_id,
        is_liked,
    }))
}

// Handler pour POST `/recipes/{recipe_id}/favorite`.
pub async fn favorite_handler(
    State(state): State<AppState>,
    Viewer(viewer_id): Viewer,
    Path(recipe_id): Path<RecipeId>,
) -> Result<Json<FavoriteResponse>, AppError> {
    let is_favorited = state.service.toggle_favorite(recipe_id, viewer_id).await?;

    state.events.record(
        recipe_id,
        viewer_id,
        RecipeEventKind::for_favorite(is_favorited),
        serde_json::json!({
            "previous_state": !is_favorited,
            "new_state": is_favorited,
        }),
    );

    Ok(Json(FavoriteResponse {
        recipe_id,
        is_favorited,
    }))
}

// Handler pour POST `/recipes/cache/clear` : vide le cache (fonction d'administration).
// Avec `?user_only=true`, le cache n'est vidé que s'il appartient à l'appelant.
pub async fn clear_cache_handler(
    State(state): State<AppState>,
    Viewer(viewer_id): Viewer,
    Query(params): Query<ClearCacheQuery>,
) -> Json<serde_json::Value> {
    let user_only = params.user_only.unwrap_or(false);
    let cleared = if user_only {
        state.service.invalidate_cache_for_user(viewer_id).await
    } else {
        state.service.invalidate_cache().await;
        true
    };
    info!("Cache clear requested by user {viewer_id} (user_only={user_only}, cleared={cleared})");

    if cleared {
        state.events.record(
            0,
            viewer_id,
            RecipeEventKind::CacheCleared,
            serde_json::json!({"action": "cache_cleared", "user_only": user_only}),
        );
    }

    Json(serde_json::json!({
        "message": "Cache cleared successfully",
        "cleared": cleared,
    }))
}

// Handler pour GET `/health` : vérifie qu'une connexion à la base est disponible.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, StatusCode> {
    match state.service.store().db().acquire().await {
        Ok(_) => Ok(Json(HealthStatus {
            status: "healthy".to_string(),
            timestamp: current_timestamp(),
        })),
        Err(e) => {
            tracing::error!("Health check failed: DB acquire error: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
