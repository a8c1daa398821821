mod answer;
mod app;
mod channels;
mod config;
mod credentials;
mod error;
mod lifecycle;
mod prompting;
mod signature;
mod slack;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod types;
mod webhooks;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,esme_server=debug,tower_http=info")),
        )
        .init();

    app::run().await
}
