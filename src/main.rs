use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use dotenv::dotenv;
use tokio::runtime::Runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use study_boosters::{
    config::Config,
    handlers::Campus,
    insight::ExamInsights,
    request_handler::routes,
    store::{establish_database_connection, table_exist},
    sync::SyncLayer,
};

fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("study_boosters=info,actix_web=info")),
        )
        .init();

    let config = Config::load();

    let server_executor = Runtime::new()?;
    server_executor.block_on(async move {
        let sync = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = establish_database_connection(&config, database_url)
                    .await
                    .map_err(std::io::Error::other)?;
                table_exist(&pool).await.map_err(std::io::Error::other)?;

                SyncLayer::postgres(pool, &config.store_root)
                    .await
                    .map_err(std::io::Error::other)?
            }
            None => {
                info!("DATABASE_URL not set, records are kept in memory");
                SyncLayer::memory(&config.store_root)
            }
        };

        let campus = Campus::new(sync);
        if let Err(e) = campus.seed_syllabus().await {
            error!(error = %e, "syllabus seeding failed");
        }

        let campus = Data::new(campus);
        let insights = Data::new(ExamInsights::new(&config));

        info!(port = config.port, workers = config.workers, root = %config.store_root, "starting server");

        HttpServer::new(move || {
            App::new()
                .wrap(Logger::default())
                .app_data(campus.clone())
                .app_data(insights.clone())
                .configure(routes)
        })
        .bind(("0.0.0.0", config.port))?
        .workers(config.workers)
        .run()
        .await
    })
}
