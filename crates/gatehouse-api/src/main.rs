mod auth;
mod clients;
mod config;
mod db;
mod error;
mod extract;
mod routes;

use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, web};
use tracing::info;

use gatehouse_core::lock::GatewayLocks;
use gatehouse_core::queue::PushQueues;
use gatehouse_core::reconcile::Reconciler;
use gatehouse_core::registry::Registry;
use gatehouse_core::settings::ReconcilerSettings;

use crate::clients::{HttpAgent, HttpProvisioner};
use crate::config::Config;
use crate::db::store::PgStore;
use crate::db::user::UserStore;

pub type AppReconciler = Reconciler<PgStore, HttpProvisioner, HttpAgent>;
pub type AppRegistry = Registry<PgStore>;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().expect("failed to load configuration");
    info!(addr = %config.bind_addr, "starting gatehouse-api");

    let pool = db::create_pool(&config.database_url).await;
    db::migrate(&pool).await;
    info!("database migrations applied");

    let store = Arc::new(PgStore::new(pool.clone()));
    let user_store = UserStore::new(pool);

    let provisioner = Arc::new(HttpProvisioner::new(
        &config.provisioner_url,
        &config.provisioner_token,
    ));
    let agent = Arc::new(HttpAgent::new(config.agent_port));
    let settings = Arc::new(ReconcilerSettings::default());
    let locks = Arc::new(GatewayLocks::new());
    let queues = Arc::new(PushQueues::new());

    let reconciler = Arc::new(AppReconciler::new(
        Arc::clone(&store),
        provisioner,
        agent,
        Arc::clone(&settings),
        Arc::clone(&locks),
        Arc::clone(&queues),
    ));
    let registry = AppRegistry::new(
        Arc::clone(&store),
        locks,
        queues,
        Arc::clone(&settings),
        config.peer_key_secret,
    );

    tokio::spawn(Arc::clone(&reconciler).run());
    info!(tick = ?settings.tick_interval, "reconciler started");

    let bind = config.bind_addr.clone();

    let config_data = web::Data::new(config);
    let store_data = web::Data::new(PgStore::clone(&store));
    let user_store_data = web::Data::new(user_store);
    let reconciler_data = web::Data::new(reconciler);
    let registry_data = web::Data::new(registry);
    let settings_data = web::Data::new(settings);

    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(store_data.clone())
            .app_data(user_store_data.clone())
            .app_data(reconciler_data.clone())
            .app_data(registry_data.clone())
            .app_data(settings_data.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/health", web::get().to(health))
            .configure(routes::auth::configure)
            .configure(routes::gateways::configure)
            .configure(routes::peers::configure)
    })
    .bind(&bind)?
    .run()
    .await
}
