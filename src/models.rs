use serde::{Deserialize, Serialize};

pub type RecipeId = i64;
pub type UserId = i64;

// Une ligne du fil partagé, sans état propre à un utilisateur.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeSummary {
    pub recipe_id: RecipeId,
    pub title: String,
    pub description: String,
    pub author_id: UserId,
    pub author_name: String,
    pub image_url: Option<String>,
    pub servings: Option<i64>,
    pub created_at: f64,
    pub likes_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonalizedRecipeView {
    #[serde(flatten)]
    pub summary: RecipeSummary,
    pub is_liked: bool,
    pub is_favorited: bool,
}

impl PersonalizedRecipeView {
    pub fn recipe_id(&self) -> RecipeId {
        self.summary.recipe_id
    }
}

#[derive(Debug, Clone)]
pub struct RecipePage {
    pub rows: Vec<PersonalizedRecipeView>,
    pub total_count: usize,
    pub served_from_cache: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRecipesQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub force_refresh: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearCacheQuery {
    pub user_only: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RecipeListResponse {
    pub recipes: Vec<PersonalizedRecipeView>,
    pub total_count: usize,
    pub limit: usize,
    pub offset: usize,
    pub from_cache: bool,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    pub recipe_id: RecipeId,
    pub is_liked: bool,
}

#[derive(Debug, Serialize)]
pub struct FavoriteResponse {
    pub recipe_id: RecipeId,
    pub is_favorited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}
