//! Basic image registry server example
//!
//! Run with: cargo run -p image-registry --example basic_server

use image_registry::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Keep everything in memory
    let storage = MemoryStorage::with_buckets(&["images"]);
    let app = RegistryBuilder::new(storage).bucket("images").build();

    let addr = "127.0.0.1:3000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Image registry listening on http://{}", addr);
    tracing::info!(
        "Try: curl -X POST -H 'Content-Type: application/json' -d '{{\"name\":\"base\"}}' http://{}/images",
        addr
    );

    axum::serve(listener, app).await?;

    Ok(())
}
