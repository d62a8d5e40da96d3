use std::future::Future;

use sqlx::sqlite::SqlitePool;
use tracing::{debug, warn};

use crate::database::current_timestamp;
use crate::error::AppError;
use crate::models::{PersonalizedRecipeView, RecipeId, RecipeSummary, UserId};

// Recettes, likes et favoris persistés : la source de vérité que suit le cache.
// Chaque toggle inverse l'appartenance dans une seule transaction et renvoie
// `RecipeNotFound` si la recette n'existe pas.
pub trait RecipeStore: Send + Sync + 'static {
    // Toutes les recettes, plus récentes d'abord, avec `likes_count` agrégé et les
    // drapeaux de l'utilisateur.
    fn get_all_with_viewer_flags(
        &self,
        viewer_id: UserId,
    ) -> impl Future<Output = Result<Vec<PersonalizedRecipeView>, AppError>> + Send;

    // Renvoie le nouvel état.
    fn toggle_like(
        &self,
        recipe_id: RecipeId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn toggle_favorite(
        &self,
        recipe_id: RecipeId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

// Colonnes : recipe_id, title, description, author_id, author_name, image_url,
// servings, created_at, likes_count, is_liked, is_favorited
type RecipeRow = (
    i64,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<i64>,
    f64,
    i64,
    i64,
    i64,
);

const SELECT_WITH_VIEWER_FLAGS: &str = "SELECT r.recipe_id, r.title, r.description, r.author_id, u.username,
        r.image_url, r.servings, r.created_at,
        (SELECT COUNT(*) FROM likes l WHERE l.recipe_id = r.recipe_id) AS likes_count,
        EXISTS(SELECT 1 FROM likes l WHERE l.recipe_id = r.recipe_id AND l.user_id = ?1) AS is_liked,
        EXISTS(SELECT 1 FROM favorites f WHERE f.recipe_id = r.recipe_id AND f.user_id = ?1) AS is_favorited
    FROM recipes r
    JOIN users u ON u.user_id = r.author_id";

fn into_view(row: RecipeRow) -> PersonalizedRecipeView {
    let (
        recipe_id,
        title,
        description,
        author_id,
        author_name,
        image_url,
        servings,
        created_at,
        likes_count,
        is_liked,
        is_favorited,
    ) = row;

    PersonalizedRecipeView {
        summary: RecipeSummary {
            recipe_id,
            title,
            description,
            author_id,
            author_name,
            image_url,
            servings,
            created_at,
            likes_count: likes_count.max(0),
        },
        is_liked: is_liked != 0,
        is_favorited: is_favorited != 0,
    }
}

#[derive(Debug, Clone, Copy)]
enum Membership {
    Like,
    Favorite,
}

impl Membership {
    fn delete_sql(self) -> &'static str {
        match self {
            Membership::Like => "DELETE FROM likes WHERE user_id = ? AND recipe_id = ?",
            Membership::Favorite => "DELETE FROM favorites WHERE user_id = ? AND recipe_id = ?",
        }
    }

    fn insert_sql(self) -> &'static str {
        match self {
            Membership::Like => {
                "INSERT INTO likes (user_id, recipe_id, created_at) VALUES (?, ?, ?)"
            }
            Membership::Favorite => {
                "INSERT INTO favorites (user_id, recipe_id, created_at) VALUES (?, ?, ?)"
            }
        }
    }
}

pub struct SqliteRecipeStore {
    db: SqlitePool,
}

impl SqliteRecipeStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn get_recipe_with_viewer_flags(
        &self,
        recipe_id: RecipeId,
        viewer_id: UserId,
    ) -> Result<PersonalizedRecipeView, AppError> {
        let sql = format!("{SELECT_WITH_VIEWER_FLAGS} WHERE r.recipe_id = ?2");
        sqlx::query_as::<_, RecipeRow>(&sql)
            .bind(viewer_id)
            .bind(recipe_id)
            .fetch_optional(&self.db)
            .await?
            .map(into_view)
            .ok_or(AppError::RecipeNotFound(recipe_id))
    }

    // Vérifie et inverse dans une seule transaction. Le DELETE passe en premier pour
    // prendre le verrou d'écriture avant toute lecture : deux toggles sur la même paire
    // sont sérialisés, le second voit toujours le résultat du premier.
    async fn toggle(
        &self,
        membership: Membership,
        recipe_id: RecipeId,
        user_id: UserId,
    ) -> Result<bool, AppError> {
        let mut tx = self.db.begin().await?;

        let removed = sqlx::query(membership.delete_sql())
            .bind(user_id)
            .bind(recipe_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed > 0 {
            tx.commit().await?;
            debug!("{membership:?} removed: recipe {recipe_id}, user {user_id}");
            return Ok(false);
        }

        let exists = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM recipes WHERE recipe_id = ?")
            .bind(recipe_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        if !exists {
            tx.rollback().await?;
            warn!("{membership:?} toggle on missing recipe {recipe_id} by user {user_id}");
            return Err(AppError::RecipeNotFound(recipe_id));
        }

        sqlx::query(membership.insert_sql())
            .bind(user_id)
            .bind(recipe_id)
            .bind(current_timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                // Seule clé étrangère restante : l'utilisateur n'existe pas.
                sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                    warn!("{membership:?} toggle on recipe {recipe_id} by unknown user {user_id}");
                    AppError::UserNotFound(user_id)
                }
                e => AppError::from(e),
            })?;

        tx.commit().await?;
        debug!("{membership:?} added: recipe {recipe_id}, user {user_id}");
        Ok(true)
    }
}

impl RecipeStore for SqliteRecipeStore {
    async fn get_all_with_viewer_flags(
        &self,
        viewer_id: UserId,
    ) -> Result<Vec<PersonalizedRecipeView>, AppError> {
        let sql = format!("{SELECT_WITH_VIEWER_FLAGS} ORDER BY r.created_at DESC, r.recipe_id DESC");
        let rows = sqlx::query_as::<_, RecipeRow>(&sql)
            .bind(viewer_id)
            .fetch_all(&self.db)
            .await?;

        Ok(rows.into_iter().map(into_view).collect())
    }

    async fn toggle_like(&self, recipe_id: RecipeId, user_id: UserId) -> Result<bool, AppError> {
        self.toggle(Membership::Like, recipe_id, user_id).await
    }

    async fn toggle_favorite(
        &self,
        recipe_id: RecipeId,
        user_id: UserId,
    ) -> Result<bool, AppError> {
        self.toggle(Membership::Favorite, recipe_id, user_id).await
    }
}

#[cfg(test)]
impl SqliteRecipeStore {
    pub(crate) async fn likes_count(&self, recipe_id: RecipeId) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM likes WHERE recipe_id = ?")
            .bind(recipe_id)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    pub(crate) async fn create_user(&self, user_id: UserId, username: &str) {
        sqlx::query("INSERT INTO users (user_id, username, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(username)
            .bind(current_timestamp())
            .execute(&self.db)
            .await
            .unwrap();
    }

    pub(crate) async fn create_recipe(
        &self,
        recipe_id: RecipeId,
        author_id: UserId,
        title: &str,
        created_at: f64,
    ) {
        sqlx::query(
            "INSERT INTO recipes (recipe_id, author_id, title, description, servings, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(recipe_id)
        .bind(author_id)
        .bind(title)
        .bind(format!("How to make {title}"))
        .bind(4i64)
        .bind(created_at)
        .execute(&self.db)
        .await
        .unwrap();
    }

    // Deux utilisateurs, trois recettes : 1 (la plus ancienne), 2, 3, toutes de l'utilisateur 1.
    pub(crate) async fn seeded() -> Self {
        let pool = crate::database::init_database(":memory:").await.unwrap();
        let store = Self::new(pool);
        store.create_user(1, "alice").await;
        store.create_user(2, "bob").await;
        store.create_recipe(1, 1, "Shakshuka", 100.0).await;
        store.create_recipe(2, 1, "Focaccia", 200.0).await;
        store.create_recipe(3, 1, "Ramen", 300.0).await;
        store
    }
}
