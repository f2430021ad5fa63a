use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stripe_sync_backend::{run, settings::Settings};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(settings).await {
        tracing::error!("server error: {e:#}");
        std::process::exit(1);
    }
}
