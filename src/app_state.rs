use crate::events::EventLog;
use crate::service::RecipeListingService;
use crate::store::SqliteRecipeStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RecipeListingService<SqliteRecipeStore>>,
    pub events: Arc<EventLog>,
}

impl AppState {
    pub fn new(
        service: Arc<RecipeListingService<SqliteRecipeStore>>,
        events: Arc<EventLog>,
    ) -> Self {
        Self { service, events }
    }
}
