// Journal des interactions sur les recettes (vues, likes, favoris, vidage du cache).
use crate::database::current_timestamp;
use crate::models::{BroadcastEvent, RecipeId, UserId};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

// Taille maximale d'un batch avant écriture immédiate.
const MAX_BATCH: usize = 500;
// Intervalle de vidage du batch.
const FLUSH_INTERVAL_MS: u64 = 20;
// Intervalle en minutes entre chaque purge.
const PURGE_INTERVAL_MINUTES: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeEventKind {
    ViewedList,
    Liked,
    Unliked,
    Favorited,
    Unfavorited,
    CacheCleared,
}

impl RecipeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipeEventKind::ViewedList => "ViewedList",
            RecipeEventKind::Liked => "Liked",
            RecipeEventKind::Unliked => "Unliked",
            RecipeEventKind::Favorited => "Favorited",
            RecipeEventKind::Unfavorited => "Unfavorited",
            RecipeEventKind::CacheCleared => "CacheCleared",
        }
    }

    pub fn for_like(is_liked: bool) -> Self {
        if is_liked {
            RecipeEventKind::Liked
        } else {
            RecipeEventKind::Unliked
        }
    }

    pub fn for_favorite(is_favorited: bool) -> Self {
        if is_favorited {
            RecipeEventKind::Favorited
        } else {
            RecipeEventKind::Unfavorited
        }
    }
}

// Un événement en attente d'écriture par le worker.
#[derive(Debug)]
pub struct RecipeEvent {
    pub recipe_id: RecipeId,
    pub user_id: UserId,
    pub kind: RecipeEventKind,
    pub data: serde_json::Value,
    pub timestamp: f64,
}

pub struct EventLog {
    // Canal pour diffuser les événements (websocket).
    pub event_tx: broadcast::Sender<Arc<BroadcastEvent>>,
    // Canal vers le worker d'écriture en base.
    db_tx: mpsc::UnboundedSender<RecipeEvent>,
}

impl EventLog {
    pub fn new(
        db: SqlitePool,
        event_tx: broadcast::Sender<Arc<BroadcastEvent>>,
        retention_hours: f64,
    ) -> Self {
        let (db_tx, mut db_rx) = mpsc::unbounded_channel::<RecipeEvent>();
        let db_clone = db.clone();

        // Worker dédié pour les écritures DB en batch, hors du chemin de requête.
        tokio::spawn(async move {
            let mut batch = Vec::with_capacity(MAX_BATCH);
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_millis(FLUSH_INTERVAL_MS));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !batch.is_empty() {
                            Self::flush_batch(&db_clone, &mut batch).await;
                        }
                    }
                    event = db_rx.recv() => match event {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= MAX_BATCH {
                                Self::flush_batch(&db_clone, &mut batch).await;
                            }
                        }
                        // Canal fermé : on écrit ce qui reste puis on sort.
                        None => {
                            Self::flush_batch(&db_clone, &mut batch).await;
                            break;
                        }
                    },
                }
            }
        });

        // Worker de purge : supprime les événements plus vieux que la rétention.
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                PURGE_INTERVAL_MINUTES * 60,
            ));

            // Pas de purge au démarrage.
            interval.tick().await;

            loop {
                interval.tick().await;
                Self::purge_old_events(&db, retention_hours).await;
            }
        });

        Self { event_tx, db_tx }
    }

    // Enregistre un événement (asynchrone, ne bloque pas) et le diffuse.
    pub fn record(
        &self,
        recipe_id: RecipeId,
        user_id: UserId,
        kind: RecipeEventKind,
        data: serde_json::Value,
    ) {
        let timestamp = current_timestamp();

        let broadcast = Arc::new(BroadcastEvent {
            event_type: kind.as_str().to_string(),
            data: serde_json::json!({
                "recipe_id": recipe_id,
                "user_id": user_id,
                "data": data,
                "timestamp": timestamp,
            }),
        });

        if self
            .db_tx
            .send(RecipeEvent {
                recipe_id,
                user_id,
                kind,
                data,
                timestamp,
            })
            .is_err()
        {
            warn!("Event worker stopped, dropping {} event", kind.as_str());
        }

        // Aucun abonné n'est pas une erreur.
        let _ = self.event_tx.send(broadcast);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastEvent>> {
        self.event_tx.subscribe()
    }

    // Écrit un batch d'événements dans une seule transaction : tout ou rien.
    pub(crate) async fn flush_batch(db: &SqlitePool, batch: &mut Vec<RecipeEvent>) {
        if batch.is_empty() {
            return;
        }

        let mut tx = match db.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                // On vide le batch pour ne pas retenter indéfiniment.
                error!("Impossible de démarrer une transaction: {}", e);
                batch.clear();
                return;
            }
        };

        let mut has_error = false;

        for event in batch.drain(..) {
            let result = sqlx::query(
                "INSERT INTO recipe_events (recipe_id, user_id, event_type, event_data, timestamp) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(event.recipe_id)
            .bind(event.user_id)
            .bind(event.kind.as_str())
            .bind(event.data.to_string())
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                error!("Erreur lors de l'écriture d'un événement: {}", e);
                has_error = true;
                break;
            }
        }

        if has_error {
            if let Err(e) = tx.rollback().await {
                error!("Erreur lors du rollback de la transaction: {}", e);
            } else {
                warn!("Transaction annulée suite à une erreur");
            }
        } else if let Err(e) = tx.commit().await {
            error!("Erreur lors du commit de la transaction: {}", e);
        }
    }

    pub(crate) async fn purge_old_events(db: &SqlitePool, retention_hours: f64) -> u64 {
        let cutoff = current_timestamp() - retention_hours * 3600.0;

        match sqlx::query("DELETE FROM recipe_events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(db)
            .await
        {
            Ok(result) => {
                let deleted = result.rows_affected();
                if deleted > 0 {
                    info!("Purge: supprimé {} anciens événements", deleted);
                }
                deleted
            }
            Err(e) => {
                error!("Erreur lors de la purge des événements: {}", e);
                0
            }
        }
    }
}
