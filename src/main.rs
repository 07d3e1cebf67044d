use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{error, info, warn};
use sqlx::postgres::PgPoolOptions;
use std::io;
use std::sync::Arc;

use taskhub::auth::{AuthService, TokenCodec};
use taskhub::config::Config;
use taskhub::error::AppError;
use taskhub::routes::{self, health};
use taskhub::shutdown::Cancellation;
use taskhub::store::{linked_stores, PgTaskStore, PgUserStore, TaskStore, UserStore};
use taskhub::tasks::TaskService;

type Stores = (Arc<dyn UserStore>, Arc<dyn TaskStore>);

async fn open_stores(config: &Config) -> Result<Stores, AppError> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .map_err(|e| AppError::db("connect to database", e))?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Connected to Postgres, migrations applied");
            Ok((
                Arc::new(PgUserStore::new(pool.clone())),
                Arc::new(PgTaskStore::new(pool)),
            ))
        }
        None => {
            warn!("DATABASE_URL not set, running on in-memory stores");
            let (users, tasks) = linked_stores();
            Ok((Arc::new(users), Arc::new(tasks)))
        }
    }
}

fn cors(allowed_origins: &[String]) -> Cors {
    let cors = if allowed_origins.is_empty() {
        Cors::default().allow_any_origin()
    } else {
        allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };
    cors.allow_any_method().allow_any_header().max_age(3600)
}

fn startup_error(err: AppError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(startup_error)?;
    let (users, tasks) = open_stores(&config).await.map_err(startup_error)?;

    let auth = web::Data::new(AuthService::new(
        users.clone(),
        TokenCodec::new(&config.jwt_secret, config.token_ttl),
        config.failed_login_delay,
    ));
    if let Some((username, password)) = &config.bootstrap_admin {
        auth.ensure_admin(username, password)
            .await
            .map_err(startup_error)?;
    }

    let task_service = web::Data::new(TaskService::new(tasks));
    let user_store: web::Data<dyn UserStore> = web::Data::from(users);

    let shutdown = Cancellation::new();
    let shutdown_data = web::Data::new(shutdown.clone());
    let sweeper = auth.spawn_revocation_sweeper(config.revocation_sweep_interval, shutdown.clone());

    let allowed_origins = config.cors_allowed_origins.clone();
    let app_auth = auth.clone();

    info!("Starting taskhub server at {}", config.server_url());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_auth.clone())
            .app_data(task_service.clone())
            .app_data(user_store.clone())
            .app_data(shutdown_data.clone())
            .wrap(cors(&allowed_origins))
            .wrap(Logger::default())
            .service(health::health)
            .service(web::scope("/api").configure(routes::config(app_auth.clone())))
    })
    .disable_signals()
    .bind((config.server_host.as_str(), config.server_port))?
    .run();

    // Fire the cancellation as soon as shutdown starts so in-flight logouts fail fast.
    let handle = server.handle();
    let signal_shutdown = shutdown.clone();
    actix_web::rt::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal_shutdown.cancel();
        handle.stop(true).await;
    });

    server.await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Revocation sweeper ended abnormally: {}", e);
    }
    info!("Server stopped");
    Ok(())
}
