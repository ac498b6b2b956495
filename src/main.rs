use tokio::net::TcpListener;
use tracing::info;
use tripmap::config::AppConfig;
use tripmap::db::{init_pool, run_migrations};
use tripmap::error::AppError;
use tripmap::routes::create_router;
use tripmap::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    let db = init_pool(&config.database_url).await?;
    run_migrations(&db).await?;

    let state = AppState::new(config.clone(), db);
    state.storage.ensure_structure().await?;
    if config.mapy_cz_api_key.is_empty() {
        info!("MAPY_CZ_API_KEY is not set; geocoding requests will be rejected upstream");
    }

    let app = create_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tripmap=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
