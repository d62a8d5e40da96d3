// Importe le pool de connexions SQLite de SQLx et le logger `info` de `tracing`.
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::{str::FromStr, time::Duration};
use tracing::info;

// Définit une structure pour représenter une migration de base de données.
struct Migration {
    // Le numéro de version de la migration, utilisé pour l'ordre d'application.
    version: i32,
    name: &'static str,
    // Le contenu SQL, intégré dans le binaire à la compilation.
    sql: &'static str,
}

// L'ordre est important.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_recipe_tables",
        sql: include_str!("../migrations/001_create_recipe_tables.sql"),
    },
    Migration {
        version: 2,
        name: "add_recipe_events",
        sql: include_str!("../migrations/002_add_recipe_events.sql"),
    },
];

// Nombre maximal de connexions pour une base sur fichier.
const MAX_CONNECTIONS: u32 = 10;

// Initialise la base de données et applique les migrations manquantes.
pub async fn init_database(db_file: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = db_file == ":memory:";

    // Les PRAGMA sont posés via les options de connexion : ils s'appliquent ainsi à
    // chaque connexion du pool, pas seulement à la première.
    let mut options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true)
            // WAL : les lecteurs ne sont pas bloqués par les écritures.
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
    };
    options = options
        .foreign_keys(true)
        // Attend 5s si la base est verrouillée avant de retourner une erreur.
        .busy_timeout(Duration::from_secs(5))
        // 128MB de cache de pages.
        .pragma("cache_size", "-128000")
        .pragma("temp_store", "MEMORY");

    // Une base `:memory:` n'existe que pour sa connexion : une seule connexion,
    // jamais recyclée, sinon chaque connexion verrait une base vide différente.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?
    };

    // Crée la table pour suivre les migrations déjà appliquées, si elle n'existe pas.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at REAL NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    for migration in MIGRATIONS {
        let applied =
            sqlx::query_as::<_, (i32,)>("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(&pool)
                .await?
                .is_some();

        if !applied {
            info!(
                "Running migration {}: {}",
                migration.version, migration.name
            );

            // Exécute la migration à l'intérieur d'une transaction : si une partie échoue, tout est annulé.
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;

            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(current_timestamp())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            info!("Migration {} applied successfully", migration.version);
        } else {
            info!("Migration {} already applied, skipping", migration.version);
        }
    }

    // `ANALYZE` collecte des statistiques pour l'optimiseur de requêtes.
    sqlx::query("ANALYZE").execute(&pool).await?;

    info!("Database initialization complete");

    Ok(pool)
}

// Timestamp actuel en secondes (f64).
pub fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
