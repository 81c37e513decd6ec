//! Monthly usage reconciliation binary.
//!
//! Runs one sweep over all plan records and exits; scheduling is external
//! (cron or an equivalent).

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adscope_engine::store::FirestoreStores;
use adscope_engine::ReconciliationJob;
use adscope_firestore::FirestoreClient;

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("adscope_engine=info".parse().expect("valid directive"))
        .add_directive("adscope_firestore=info".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting adscope reconciliation sweep");

    let firestore = match FirestoreClient::from_env().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create Firestore client: {}", e);
            std::process::exit(1);
        }
    };

    let stores = Arc::new(FirestoreStores::new(firestore));
    let job = ReconciliationJob::new(stores);

    match job.sweep(Utc::now()).await {
        Ok(reset_count) => {
            info!(reset_count, "Reconciliation sweep finished");
        }
        Err(e) => {
            error!("Reconciliation sweep failed: {}", e);
            std::process::exit(1);
        }
    }
}
