use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use creative_cache::{
    config::Config,
    web::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "creative_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let bind_address = config.bind_address();
    info!(
        cache_dir = %config.cache_dir.display(),
        cache_url = %config.cache_base_url,
        session_ttl_secs = config.session_ttl.as_secs(),
        "configuration loaded"
    );

    let api_root = config.route("");
    let router = web::build_router(AppState::new(config));
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("creative cache listening on http://{bind_address}{api_root}");

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
