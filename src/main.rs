use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, middleware::Logger, web};
use tracing::info;
use tracing_subscriber::EnvFilter;

use parkd::config::Config;
use parkd::http::{self, AppState};
use parkd::tenant::TenantManager;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    parkd::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;

    let tenants = Arc::new(TenantManager::new(
        PathBuf::from(&config.data_dir),
        config.clone(),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    info!("parkd listening on {addr}");
    info!("  data_dir: {}", config.data_dir);
    info!("  auth: {}", if config.api_token.is_some() { "bearer token" } else { "open" });
    info!(
        "  auto-release: {}",
        if config.release.is_active() {
            format!("{} min grace", config.release.grace_minutes)
        } else {
            "disabled".to_string()
        }
    );
    info!("  expand horizon: {} day(s)", config.expand.horizon_days);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let state = web::Data::new(AppState {
        tenants,
        token: config.api_token.clone(),
        release: config.release,
        expand: config.expand,
    });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .configure(http::routes)
    })
    .bind(&addr)?
    .run()
    .await
}
