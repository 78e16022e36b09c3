//! coalesce-server: HTTP server for the contact identity consolidation
//! service.
//!
//! Persists contacts, users, and sessions in SQLite and exposes the
//! `/identify` and `/auth/*` endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use coalesce::clog;
use coalesce::consolidate::Consolidator;
use coalesce::logging;
use coalesce::server::{app, AppState};
use coalesce::store::SqliteStore;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

struct Config {
    bind_addr: String,
    db_path: PathBuf,
    open_signup: bool,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("COALESCE_BIND")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            db_path: std::env::var("COALESCE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("coalesce.db")),
            open_signup: std::env::var("COALESCE_OPEN_SIGNUP")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    logging::init();
    let config = Config::from_env();

    let store = SqliteStore::open(&config.db_path).expect("failed to open database");
    clog!("opened database at {}", config.db_path.display());

    let state = Arc::new(Mutex::new(AppState {
        consolidator: Consolidator::new(store),
        open_signup: config.open_signup,
    }));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    clog!("listening on {}", config.bind_addr);

    axum::serve(listener, app(state)).await.expect("server error");
}
