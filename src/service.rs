use crate::cache::{slice_page, DeltaOutcome, RecipeSnapshotCache};
use crate::error::AppError;
use crate::models::{RecipePage, RecipeId, UserId};
use crate::store::RecipeStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// Sert les pages du fil depuis le cache et y reporte les toggles confirmés.
// La base est toujours appelée en premier, hors du verrou du cache.
pub struct RecipeListingService<S> {
    store: Arc<S>,
    cache: RecipeSnapshotCache,
}

impl<S: RecipeStore> RecipeListingService<S> {
    pub fn new(store: Arc<S>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: RecipeSnapshotCache::new(cache_ttl),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &RecipeSnapshotCache {
        &self.cache
    }

    pub async fn list_recipes(
        &self,
        viewer_id: UserId,
        limit: usize,
        offset: usize,
        force_refresh: bool,
    ) -> Result<RecipePage, AppError> {
        if !force_refresh {
            if let Some((rows, total_count)) = self.cache.get_page(viewer_id, limit, offset).await {
                return Ok(RecipePage {
                    rows,
                    total_count,
                    served_from_cache: true,
                });
            }
        }

        info!("Loading recipes from store for user {viewer_id} (force_refresh={force_refresh})");
        let ticket = self.cache.fill_ticket().await;
        let all_rows = self
            .store
            .get_all_with_viewer_flags(viewer_id)
            .await
            .inspect_err(|e| error!("Recipe reload for user {viewer_id} failed: {e}"))?;

        let total_count = all_rows.len();
        let rows = slice_page(&all_rows, limit, offset);
        self.cache
            .populate_if_unchanged(ticket, viewer_id, all_rows)
            .await;

        Ok(RecipePage {
            rows,
            total_count,
            served_from_cache: false,
        })
    }

    pub async fn toggle_like(
        &self,
        recipe_id: RecipeId,
        acting_user_id: UserId,
    ) -> Result<bool, AppError> {
        let _toggle = self.cache.begin_toggle();
        let is_liked = self.store.toggle_like(recipe_id, acting_user_id).await?;
        let outcome = self
            .cache
            .apply_like_delta(recipe_id, acting_user_id, is_liked)
            .await;
        self.drop_if_reordered(outcome, recipe_id, acting_user_id)
            .await;

        info!(
            "Recipe {recipe_id} {} by user {acting_user_id}",
            if is_liked { "liked" } else { "unliked" }
        );
        Ok(is_liked)
    }

    pub async fn toggle_favorite(
        &self,
        recipe_id: RecipeId,
        acting_user_id: UserId,
    ) -> Result<bool, AppError> {
        let _toggle = self.cache.begin_toggle();
        let is_favorited = self
            .store
            .toggle_favorite(recipe_id, acting_user_id)
            .await?;
        let outcome = self
            .cache
            .apply_favorite_delta(recipe_id, acting_user_id, is_favorited)
            .await;
        self.drop_if_reordered(outcome, recipe_id, acting_user_id)
            .await;

        info!(
            "Recipe {recipe_id} {} by user {acting_user_id}",
            if is_favorited { "favorited" } else { "unfavorited" }
        );
        Ok(is_favorited)
    }

    // Chaque toggle confirmé par la base est un vrai flip : si l'index du propriétaire
    // avait déjà l'état cible, deux toggles concurrents ont été reportés dans le
    // désordre. On abandonne la génération, le prochain chargement relit la base.
    async fn drop_if_reordered(
        &self,
        outcome: DeltaOutcome,
        recipe_id: RecipeId,
        acting_user_id: UserId,
    ) {
        if outcome == DeltaOutcome::Redundant {
            warn!(
                "Out-of-order cache update on recipe {recipe_id} by user {acting_user_id}, dropping cache"
            );
            self.cache.invalidate_for_user(acting_user_id).await;
        }
    }

    pub async fn invalidate_cache(&self) {
        self.cache.invalidate().await;
    }

    pub async fn invalidate_cache_for_user(&self, user_id: UserId) -> bool {
        self.cache.invalidate_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::view;
    use crate::models::PersonalizedRecipeView;
    use crate::store::SqliteRecipeStore;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    // Base en mémoire : recette -> utilisateurs qui l'ont likée / mise en favori.
    // Les délais en file retardent la réponse (pas l'écriture) des prochains appels.
    #[derive(Default)]
    struct MemoryStore {
        likes: Mutex<BTreeMap<RecipeId, BTreeSet<UserId>>>,
        favorites: Mutex<BTreeMap<RecipeId, BTreeSet<UserId>>>,
        reloads: AtomicUsize,
        unavailable: AtomicBool,
        read_delays: Mutex<VecDeque<Duration>>,
        like_reply_delays: Mutex<VecDeque<Duration>>,
    }

    impl MemoryStore {
        fn with_recipes(ids: &[RecipeId]) -> Self {
            let store = Self::default();
            {
                let mut likes = store.likes.try_lock().unwrap();
                let mut favorites = store.favorites.try_lock().unwrap();
                for id in ids {
                    likes.insert(*id, BTreeSet::new());
                    favorites.insert(*id, BTreeSet::new());
                }
            }
            store
        }

        fn reloads(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }

        async fn delay_reply(delays: &Mutex<VecDeque<Duration>>) {
            let delay = delays.lock().await.pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn check_available(&self) -> Result<(), AppError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(AppError::StoreUnavailable(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    async fn flip(
        table: &Mutex<BTreeMap<RecipeId, BTreeSet<UserId>>>,
        recipe_id: RecipeId,
        user_id: UserId,
    ) -> Result<bool, AppError> {
        let mut table = table.lock().await;
        let members = table
            .get_mut(&recipe_id)
            .ok_or(AppError::RecipeNotFound(recipe_id))?;
        if members.remove(&user_id) {
            Ok(false)
        } else {
            members.insert(user_id);
            Ok(true)
        }
    }

    impl RecipeStore for MemoryStore {
        async fn get_all_with_viewer_flags(
            &self,
            viewer_id: UserId,
        ) -> Result<Vec<PersonalizedRecipeView>, AppError> {
            self.check_available()?;
            self.reloads.fetch_add(1, Ordering::SeqCst);
            let rows: Vec<PersonalizedRecipeView> = {
                let likes = self.likes.lock().await;
                let favorites = self.favorites.lock().await;
                likes
                    .iter()
                    .rev()
                    .map(|(id, likers)| {
                        let mut row =
                            view(*id, likers.len() as i64, likers.contains(&viewer_id));
                        row.is_favorited = favorites[id].contains(&viewer_id);
                        row
                    })
                    .collect()
            };
            Self::delay_reply(&self.read_delays).await;
            Ok(rows)
        }

        async fn toggle_like(&self, recipe_id: RecipeId, user_id: UserId) -> Result<bool, AppError> {
            self.check_available()?;
            let is_liked = flip(&self.likes, recipe_id, user_id).await?;
            Self::delay_reply(&self.like_reply_delays).await;
            Ok(is_liked)
        }

        async fn toggle_favorite(
            &self,
            recipe_id: RecipeId,
            user_id: UserId,
        ) -> Result<bool, AppError> {
            self.check_available()?;
            flip(&self.favorites, recipe_id, user_id).await
        }
    }

    const TTL: Duration = Duration::from_secs(600);

    fn service(ids: &[RecipeId]) -> RecipeListingService<MemoryStore> {
        RecipeListingService::new(Arc::new(MemoryStore::with_recipes(ids)), TTL)
    }

    fn find(page: &RecipePage, recipe_id: RecipeId) -> &PersonalizedRecipeView {
        page.rows.iter().find(|r| r.recipe_id() == recipe_id).unwrap()
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let svc = service(&[1, 2, 3]);

        let first = svc.list_recipes(1, 2, 0, false).await.unwrap();
        assert!(!first.served_from_cache);
        assert_eq!(first.total_count, 3);
        assert_eq!(first.rows.iter().map(|r| r.recipe_id()).collect::<Vec<_>>(), vec![3, 2]);

        let second = svc.list_recipes(1, 2, 2, false).await.unwrap();
        assert!(second.served_from_cache);
        assert_eq!(second.total_count, 3);
        assert_eq!(second.rows.len(), 1);
        assert_eq!(svc.store().reloads(), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let svc = service(&[1]);
        svc.list_recipes(1, 10, 0, false).await.unwrap();

        let page = svc.list_recipes(1, 10, 0, true).await.unwrap();
        assert!(!page.served_from_cache);
        assert_eq!(svc.store().reloads(), 2);
    }

    #[tokio::test]
    async fn documented_like_scenario() {
        let svc = service(&[42]);
        {
            let mut likes = svc.store().likes.lock().await;
            likes.get_mut(&42).unwrap().extend([10, 11, 12]);
        }

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert_eq!(find(&page, 42).summary.likes_count, 3);
        assert!(!find(&page, 42).is_liked);

        assert!(svc.toggle_like(42, 1).await.unwrap());

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert_eq!(find(&page, 42).summary.likes_count, 4);
        assert!(find(&page, 42).is_liked);

        let other = svc.list_recipes(2, 10, 0, false).await.unwrap();
        assert!(!other.served_from_cache);
        assert!(!find(&other, 42).is_liked);
        assert_eq!(svc.store().reloads(), 2);
    }

    #[tokio::test]
    async fn users_never_see_each_others_flags() {
        let svc = service(&[1, 2]);
        svc.toggle_like(1, 1).await.unwrap();
        svc.toggle_favorite(2, 1).await.unwrap();

        let alice = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(find(&alice, 1).is_liked && find(&alice, 2).is_favorited);

        let bob = svc.list_recipes(2, 10, 0, false).await.unwrap();
        assert!(!find(&bob, 1).is_liked && !find(&bob, 2).is_favorited);
        assert_eq!(find(&bob, 1).summary.likes_count, 1);

        // Le toggle d'Alice pendant que la génération de Bob est résidente ne marque pas sa vue.
        svc.toggle_like(2, 1).await.unwrap();
        let bob = svc.list_recipes(2, 10, 0, false).await.unwrap();
        assert!(bob.served_from_cache);
        assert!(!find(&bob, 2).is_liked);
        assert_eq!(find(&bob, 2).summary.likes_count, 1);
    }

    #[tokio::test]
    async fn read_your_writes_for_favorites() {
        let svc = service(&[5]);
        svc.list_recipes(3, 10, 0, false).await.unwrap();

        assert!(svc.toggle_favorite(5, 3).await.unwrap());
        let page = svc.list_recipes(3, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert!(find(&page, 5).is_favorited);

        assert!(!svc.toggle_favorite(5, 3).await.unwrap());
        let page = svc.list_recipes(3, 10, 0, false).await.unwrap();
        assert!(!find(&page, 5).is_favorited);
    }

    #[tokio::test]
    async fn not_found_is_surfaced_and_cache_untouched() {
        let svc = service(&[1]);
        svc.list_recipes(1, 10, 0, false).await.unwrap();

        assert!(matches!(
            svc.toggle_like(99, 1).await,
            Err(AppError::RecipeNotFound(99))
        ));
        assert!(matches!(
            svc.toggle_favorite(99, 1).await,
            Err(AppError::RecipeNotFound(99))
        ));
        assert!(svc.list_recipes(1, 10, 0, false).await.unwrap().served_from_cache);
    }

    #[tokio::test]
    async fn store_failure_leaves_cache_as_it_was() {
        let svc = service(&[1]);
        svc.list_recipes(1, 10, 0, false).await.unwrap();

        svc.store().unavailable.store(true, Ordering::SeqCst);
        assert!(matches!(
            svc.toggle_like(1, 1).await,
            Err(AppError::StoreUnavailable(_))
        ));
        assert!(matches!(
            svc.list_recipes(2, 10, 0, false).await,
            Err(AppError::StoreUnavailable(_))
        ));

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert!(!find(&page, 1).is_liked);
        assert_eq!(find(&page, 1).summary.likes_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_generation_triggers_reload() {
        let svc = service(&[1]);
        svc.list_recipes(1, 10, 0, false).await.unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(!page.served_from_cache);
        assert_eq!(svc.store().reloads(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let svc = service(&[1]);
        svc.list_recipes(1, 10, 0, false).await.unwrap();

        assert!(!svc.invalidate_cache_for_user(2).await);
        assert!(svc.list_recipes(1, 10, 0, false).await.unwrap().served_from_cache);

        svc.invalidate_cache().await;
        assert!(!svc.list_recipes(1, 10, 0, false).await.unwrap().served_from_cache);
    }

    #[tokio::test]
    async fn concurrent_likes_by_distinct_users_match_store() {
        let svc = Arc::new(service(&[42]));
        svc.list_recipes(0, 10, 0, false).await.unwrap();

        let mut handles = Vec::new();
        for user in 1..=20 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.toggle_like(42, user).await.unwrap();
                if user % 4 == 0 {
                    svc.toggle_like(42, user).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let page = svc.list_recipes(0, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert_eq!(find(&page, 42).summary.likes_count, 15);
        assert_eq!(svc.store().likes.lock().await[&42].len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn owner_toggles_answered_out_of_order_fall_back_to_store() {
        let svc = Arc::new(service(&[42]));
        svc.list_recipes(1, 10, 0, false).await.unwrap();
        svc.store()
            .like_reply_delays
            .lock()
            .await
            .push_back(Duration::from_millis(100));

        // Le premier toggle écrit tout de suite mais répond en dernier.
        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.toggle_like(42, 1).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = svc.toggle_like(42, 1).await.unwrap();
        let first = first.await.unwrap();
        assert!(first);
        assert!(!second);
        assert!(svc.store().likes.lock().await[&42].is_empty());

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(!page.served_from_cache);
        assert!(!find(&page, 42).is_liked);
        assert_eq!(find(&page, 42).summary.likes_count, 0);
        assert_eq!(svc.store().reloads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_during_refill_is_visible_on_next_read() {
        let svc = Arc::new(service(&[42]));
        svc.store()
            .read_delays
            .lock()
            .await
            .push_back(Duration::from_millis(100));

        let refill = tokio::spawn({
            let svc = svc.clone();
            async move { svc.list_recipes(1, 10, 0, false).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(svc.toggle_like(42, 1).await.unwrap());

        let before_toggle = refill.await.unwrap();
        assert!(!before_toggle.served_from_cache);
        assert!(!find(&before_toggle, 42).is_liked);

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(!page.served_from_cache);
        assert!(find(&page, 42).is_liked);
        assert_eq!(find(&page, 42).summary.likes_count, 1);

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert!(find(&page, 42).is_liked);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_overlapping_a_slow_toggle_does_not_double_count() {
        let svc = Arc::new(service(&[42]));
        svc.store()
            .like_reply_delays
            .lock()
            .await
            .push_back(Duration::from_millis(100));

        // Le like de l'utilisateur 2 est écrit avant la lecture du rechargement de
        // l'utilisateur 1, mais reporté dans le cache après ce rechargement.
        let like = tokio::spawn({
            let svc = svc.clone();
            async move { svc.toggle_like(42, 2).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert_eq!(find(&page, 42).summary.likes_count, 1);
        assert!(like.await.unwrap());

        let page = svc.list_recipes(1, 10, 0, false).await.unwrap();
        assert_eq!(find(&page, 42).summary.likes_count, 1);
        assert_eq!(svc.store().likes.lock().await[&42].len(), 1);
    }

    #[tokio::test]
    async fn sqlite_backed_round_trip() {
        let store = Arc::new(SqliteRecipeStore::seeded().await);
        let svc = RecipeListingService::new(store.clone(), TTL);

        let page = svc.list_recipes(2, 10, 0, false).await.unwrap();
        assert_eq!(page.total_count, 3);

        assert!(svc.toggle_like(1, 2).await.unwrap());
        let page = svc.list_recipes(2, 10, 0, false).await.unwrap();
        assert!(page.served_from_cache);
        assert!(find(&page, 1).is_liked);
        assert_eq!(
            find(&page, 1).summary.likes_count,
            store.likes_count(1).await.unwrap()
        );

        let fresh = svc.list_recipes(2, 10, 0, true).await.unwrap();
        assert_eq!(find(&fresh, 1), find(&page, 1));
    }
}
