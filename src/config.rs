use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub struct Config {
    pub port: u16,
    pub database_file: String,
    pub cache_ttl: Duration,
    pub event_retention_hours: f64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("PORT", 5000),
            database_file: try_load("DATABASE_FILE", ":memory:".to_string()),
            cache_ttl: Duration::from_secs(try_load("RECIPE_CACHE_TTL_SECS", 600)),
            event_retention_hours: try_load_checked(
                "EVENT_RETENTION_HOURS",
                24.0 * 30.0,
                |hours: &f64| hours.is_finite() && *hours > 0.0,
            ),
        }
    }
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    try_load_checked(key, default, |_| true)
}

fn try_load_checked<T>(key: &str, default: T, accept: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = env::var(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };

    parse_checked(key, &raw, default, accept)
}

// Une valeur illisible ou refusée par `accept` est remplacée par la valeur par défaut.
fn parse_checked<T>(key: &str, raw: &str, default: T, accept: impl Fn(&T) -> bool) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) if accept(&value) => value,
        Ok(value) => {
            warn!("Out of range {key} value {value}, using default: {default}");
            default
        }
        Err(e) => {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
            default
        }
    }
}
