// Serveur du fil de recettes.
//
// Un seul cache de snapshot sert le fil paginé à tous les utilisateurs ; chaque toggle
// de like ou de favori est écrit en base (source de vérité) puis reporté dans le cache.
// Une seule génération est résidente à la fois : la requête d'un autre utilisateur
// l'évince et recharge depuis la base.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, signal, sync::broadcast};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub mod app_state;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod service;
pub mod store;
pub mod websocket;

use app_state::AppState;
use config::Config;
use database::init_database;
use events::EventLog;
use handlers::{
    clear_cache_handler, favorite_handler, get_recipe_handler, health_check, like_handler,
    list_recipes_handler,
};
use service::RecipeListingService;
use store::SqliteRecipeStore;
use websocket::ws_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/recipes", get(list_recipes_handler))
        .route("/recipes/cache/clear", post(clear_cache_handler))
        .route("/recipes/{recipe_id}", get(get_recipe_handler))
        .route("/recipes/{recipe_id}/like", post(like_handler))
        .route("/recipes/{recipe_id}/favorite", post(favorite_handler))
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start_server() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::load();

    info!("Initializing database...");
    let pool = init_database(&config.database_file).await?;

    let (event_tx, _) = broadcast::channel(1000);
    let events = Arc::new(EventLog::new(
        pool.clone(),
        event_tx,
        config.event_retention_hours,
    ));

    let store = Arc::new(SqliteRecipeStore::new(pool));
    let service = Arc::new(RecipeListingService::new(store, config.cache_ttl));
    info!("Recipe cache TTL: {:?}", service.cache().ttl());

    let state = AppState::new(service, events);
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server starting on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("Server shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
