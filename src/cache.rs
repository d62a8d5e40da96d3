use crate::models::{PersonalizedRecipeView, RecipeId, RecipeSummary, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Recettes likées et favorites d'un seul utilisateur.
#[derive(Debug, Clone)]
pub struct UserInteractionIndex {
    owner_user_id: UserId,
    liked_ids: HashSet<RecipeId>,
    favorited_ids: HashSet<RecipeId>,
}

impl UserInteractionIndex {
    pub fn new(owner_user_id: UserId) -> Self {
        Self {
            owner_user_id,
            liked_ids: HashSet::new(),
            favorited_ids: HashSet::new(),
        }
    }

    fn from_rows(owner_user_id: UserId, rows: &[PersonalizedRecipeView]) -> Self {
        let mut index = Self::new(owner_user_id);
        for row in rows {
            if row.is_liked {
                index.liked_ids.insert(row.recipe_id());
            }
            if row.is_favorited {
                index.favorited_ids.insert(row.recipe_id());
            }
        }
        index
    }

    pub fn owner(&self) -> UserId {
        self.owner_user_id
    }

    pub fn is_liked(&self, recipe_id: RecipeId) -> bool {
        self.liked_ids.contains(&recipe_id)
    }

    pub fn is_favorited(&self, recipe_id: RecipeId) -> bool {
        self.favorited_ids.contains(&recipe_id)
    }

    pub fn liked_count(&self) -> usize {
        self.liked_ids.len()
    }

    pub fn favorited_count(&self) -> usize {
        self.favorited_ids.len()
    }

    // `true` si l'appartenance a réellement changé.
    fn set_liked(&mut self, recipe_id: RecipeId, liked: bool) -> bool {
        if liked {
            self.liked_ids.insert(recipe_id)
        } else {
            self.liked_ids.remove(&recipe_id)
        }
    }

    fn set_favorited(&mut self, recipe_id: RecipeId, favorited: bool) -> bool {
        if favorited {
            self.favorited_ids.insert(recipe_id)
        } else {
            self.favorited_ids.remove(&recipe_id)
        }
    }
}

// Un snapshot complet du fil, personnalisé pour son seul propriétaire.
// L'index n'est accessible que via `index_for`, qui refuse tout autre utilisateur.
#[derive(Debug)]
pub struct CacheGeneration {
    base_rows: Vec<RecipeSummary>,
    positions: HashMap<RecipeId, usize>,
    index: UserInteractionIndex,
    created_at: Instant,
    ttl: Duration,
}

impl CacheGeneration {
    fn new(owner_user_id: UserId, rows: Vec<PersonalizedRecipeView>, ttl: Duration) -> Self {
        let index = UserInteractionIndex::from_rows(owner_user_id, &rows);
        let base_rows: Vec<RecipeSummary> = rows
            .into_iter()
            .map(|row| {
                let mut summary = row.summary;
                summary.likes_count = summary.likes_count.max(0);
                summary
            })
            .collect();
        let positions = base_rows
            .iter()
            .enumerate()
            .map(|(pos, row)| (row.recipe_id, pos))
            .collect();

        Self {
            base_rows,
            positions,
            index,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn owner(&self) -> UserId {
        self.index.owner()
    }

    pub fn len(&self) -> usize {
        self.base_rows.len()
    }

    pub fn is_valid(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }

    pub fn index_for(&self, viewer_id: UserId) -> Option<&UserInteractionIndex> {
        (self.index.owner() == viewer_id).then_some(&self.index)
    }

    fn page(
        &self,
        viewer_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Option<Vec<PersonalizedRecipeView>> {
        let index = self.index_for(viewer_id)?;
        let start = offset.min(self.base_rows.len());
        let end = start.saturating_add(limit).min(self.base_rows.len());

        Some(
            self.base_rows[start..end]
                .iter()
                .map(|summary| PersonalizedRecipeView {
                    is_liked: index.is_liked(summary.recipe_id),
                    is_favorited: index.is_favorited(summary.recipe_id),
                    summary: summary.clone(),
                })
                .collect(),
        )
    }

    fn row_mut(&mut self, recipe_id: RecipeId) -> Option<&mut RecipeSummary> {
        let pos = *self.positions.get(&recipe_id)?;
        self.base_rows.get_mut(pos)
    }
}

// Effet d'un toggle confirmé sur le snapshot résident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    // L'index du propriétaire avait déjà l'état cible.
    Redundant,
    // Rien de résident, ou recette absente du snapshot.
    Stale,
}

// État des compteurs au moment où un rechargement lit la base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    mutations: u64,
    toggles_started: u64,
    toggles_finished: u64,
}

// Marque un toggle en cours, de l'appel à la base jusqu'à la mise à jour du cache.
// Le compteur de fin est incrémenté au drop, y compris en cas d'erreur ou d'annulation.
pub struct ToggleGuard<'a> {
    cache: &'a RecipeSnapshotCache,
}

impl Drop for ToggleGuard<'_> {
    fn drop(&mut self) {
        self.cache.toggles_finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct CacheState {
    resident: Option<CacheGeneration>,
    // incrémenté par chaque delta et chaque invalidation
    mutations: u64,
}

// Cache à un seul emplacement : au plus une génération, pour un seul utilisateur.
// Un seul mutex, jamais tenu pendant une I/O.
#[derive(Debug)]
pub struct RecipeSnapshotCache {
    state: Mutex<CacheState>,
    toggles_started: AtomicU64,
    toggles_finished: AtomicU64,
    ttl: Duration,
}

impl RecipeSnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            toggles_started: AtomicU64::new(0),
            toggles_finished: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // `None` si rien n'est résident, si la génération appartient à un autre
    // utilisateur ou si le TTL est écoulé.
    pub async fn get_page(
        &self,
        viewer_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Option<(Vec<PersonalizedRecipeView>, usize)> {
        let state = self.state.lock().await;
        let Some(generation) = state.resident.as_ref() else {
            debug!("Cache miss for user {viewer_id}: nothing resident");
            return None;
        };

        if !generation.is_valid() {
            debug!("Cache miss for user {viewer_id}: generation expired");
            return None;
        }

        match generation.page(viewer_id, limit, offset) {
            Some(rows) => {
                debug!(
                    "Cache hit for user {viewer_id}: {} rows at offset {offset}",
                    rows.len()
                );
                Some((rows, generation.len()))
            }
            None => {
                debug!(
                    "Cache miss for user {viewer_id}: resident generation belongs to user {}",
                    generation.owner()
                );
                None
            }
        }
    }

    // Remplace la génération résidente, quel que soit son propriétaire.
    pub async fn populate(&self, viewer_id: UserId, rows: Vec<PersonalizedRecipeView>) {
        let generation = CacheGeneration::new(viewer_id, rows, self.ttl);
        let mut state = self.state.lock().await;
        Self::install(&mut state, generation);
    }

    pub fn begin_toggle(&self) -> ToggleGuard<'_> {
        self.toggles_started.fetch_add(1, Ordering::SeqCst);
        ToggleGuard { cache: self }
    }

    pub async fn fill_ticket(&self) -> FillTicket {
        let state = self.state.lock().await;
        self.ticket(&state)
    }

    fn ticket(&self, state: &CacheState) -> FillTicket {
        FillTicket {
            mutations: state.mutations,
            toggles_started: self.toggles_started.load(Ordering::SeqCst),
            toggles_finished: self.toggles_finished.load(Ordering::SeqCst),
        }
    }

    // Comme `populate`, mais abandonne si un toggle était en cours au moment du ticket,
    // a commencé depuis, ou si un delta ou une invalidation est arrivé entre-temps :
    // `rows` pourrait alors précéder ce changement.
    pub async fn populate_if_unchanged(
        &self,
        ticket: FillTicket,
        viewer_id: UserId,
        rows: Vec<PersonalizedRecipeView>,
    ) -> bool {
        let generation = CacheGeneration::new(viewer_id, rows, self.ttl);
        let mut state = self.state.lock().await;
        let now = self.ticket(&state);
        if now != ticket || ticket.toggles_started != ticket.toggles_finished {
            info!(
                "Skipping cache fill for user {viewer_id}: {} change(s), {} toggle(s) started since the store read",
                now.mutations - ticket.mutations,
                now.toggles_started - ticket.toggles_started
            );
            return false;
        }
        Self::install(&mut state, generation);
        true
    }

    fn install(state: &mut CacheState, generation: CacheGeneration) {
        if let Some(previous) = state.resident.as_ref() {
            if previous.owner() != generation.owner() {
                info!(
                    "Evicting cache of user {} for user {}",
                    previous.owner(),
                    generation.owner()
                );
            }
        }
        info!(
            "Cache populated for user {}: {} recipes, {} likes, {} favorites",
            generation.owner(),
            generation.len(),
            generation.index.liked_count(),
            generation.index.favorited_count()
        );
        state.resident = Some(generation);
    }

    // Reporte un like confirmé par la base.
    // Pour le propriétaire, la transition est vérifiée contre `liked_ids` : rejouer le même
    // état cible ne compte qu'une fois. Pour les autres, la base a confirmé un flip, le
    // compteur bouge donc d'une unité.
    pub async fn apply_like_delta(
        &self,
        recipe_id: RecipeId,
        acting_user_id: UserId,
        new_is_liked: bool,
    ) -> DeltaOutcome {
        let mut state = self.state.lock().await;
        state.mutations += 1;

        let Some(generation) = state.resident.as_mut() else {
            debug!("Like delta on recipe {recipe_id} dropped: nothing resident");
            return DeltaOutcome::Stale;
        };

        if !generation.positions.contains_key(&recipe_id) {
            warn!("Like delta on recipe {recipe_id} dropped: not in resident snapshot");
            return DeltaOutcome::Stale;
        }

        let transitioned = if generation.owner() == acting_user_id {
            generation.index.set_liked(recipe_id, new_is_liked)
        } else {
            true
        };

        if let Some(row) = generation.row_mut(recipe_id) {
            if transitioned {
                row.likes_count = if new_is_liked {
                    row.likes_count + 1
                } else {
                    (row.likes_count - 1).max(0)
                };
            }
            debug!(
                "Recipe {recipe_id}: likes_count={}, user {acting_user_id} liked={new_is_liked}",
                row.likes_count
            );
        }

        if transitioned {
            DeltaOutcome::Applied
        } else {
            DeltaOutcome::Redundant
        }
    }

    // Pas de compteur pour les favoris : seul l'index du propriétaire change.
    pub async fn apply_favorite_delta(
        &self,
        recipe_id: RecipeId,
        acting_user_id: UserId,
        new_is_favorited: bool,
    ) -> DeltaOutcome {
        let mut state = self.state.lock().await;
        state.mutations += 1;

        let Some(generation) = state.resident.as_mut() else {
            debug!("Favorite delta on recipe {recipe_id} dropped: nothing resident");
            return DeltaOutcome::Stale;
        };

        if !generation.positions.contains_key(&recipe_id) {
            warn!("Favorite delta on recipe {recipe_id} dropped: not in resident snapshot");
            return DeltaOutcome::Stale;
        }

        if generation.owner() != acting_user_id {
            debug!(
                "Favorite by user {acting_user_id} not mirrored: cache belongs to user {}",
                generation.owner()
            );
            return DeltaOutcome::Applied;
        }

        if generation
            .index
            .set_favorited(recipe_id, new_is_favorited)
        {
            DeltaOutcome::Applied
        } else {
            DeltaOutcome::Redundant
        }
    }

    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.mutations += 1;
        state.resident = None;
        info!("Cache invalidated completely");
    }

    // Ne vide le cache que s'il appartient à `user_id`.
    pub async fn invalidate_for_user(&self, user_id: UserId) -> bool {
        let mut state = self.state.lock().await;
        let owner = state.resident.as_ref().map(CacheGeneration::owner);
        match owner {
            Some(owner) if owner == user_id => {
                state.mutations += 1;
                state.resident = None;
                info!("Cache invalidated for user {user_id}");
                true
            }
            owner => {
                debug!("Cache not invalidated for user {user_id}: resident owner is {owner:?}");
                false
            }
        }
    }
}

// `rows[offset..offset + limit]`, borné au nombre de lignes.
pub fn slice_page<T: Clone>(rows: &[T], limit: usize, offset: usize) -> Vec<T> {
    let start = offset.min(rows.len());
    let end = start.saturating_add(limit).min(rows.len());
    rows[start..end].to_vec()
}
