//! Example of queueing a signed activity for several inboxes
//!
//! Usage:
//!
//! ```text
//! cargo run --example outbound_delivery -- <key-id> <private-key.pem> <inbox-url>...
//! ```
//!
//! The pool is stopped after a short while; whatever is still pending is
//! printed as delivery records that could be persisted and restored later.

use std::sync::Arc;
use std::time::Duration;

use fedi_delivery::config::AppConfig;
use fedi_delivery::delivery::WorkerPool;
use fedi_delivery::httpclient::{Client, HttpSignatureSigner, Signer};
use serde_json::json;
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedi_delivery=debug".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(key_id), Some(key_path)) = (args.next(), args.next()) else {
        eprintln!("usage: outbound_delivery <key-id> <private-key.pem> <inbox-url>...");
        std::process::exit(2);
    };
    let inboxes = args.map(|s| Url::parse(&s)).collect::<Result<Vec<_>, _>>()?;

    let pem = std::fs::read_to_string(key_path)?;
    let signer: Arc<dyn Signer> = Arc::new(HttpSignatureSigner::from_pem(key_id.clone(), &pem)?);

    let config = AppConfig::load()?;
    let client = Arc::new(Client::new(&config.http_client)?);
    let pool = WorkerPool::new(client, &config.delivery);

    let actor = key_id.split('#').next().unwrap_or(&key_id).to_string();
    let note = format!("{}/notes/demo", actor);
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/activity", note),
        "type": "Create",
        "actor": actor,
        "object": {
            "id": note,
            "type": "Note",
            "content": "Hello from fedi-delivery",
        },
    });

    let queued = pool.enqueue_to_inboxes(
        &actor,
        &note,
        inboxes,
        serde_json::to_vec(&activity)?,
        Some(signer),
    );
    println!("queued {} deliveries", queued);

    pool.start(config.delivery.effective_pool_size());
    tokio::time::sleep(Duration::from_secs(10)).await;
    pool.stop().await;

    while let Some(delivery) = pool.queue().pop() {
        println!("pending: {}", delivery.to_record().to_json()?);
    }

    Ok(())
}
