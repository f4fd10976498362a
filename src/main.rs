use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use actix_cors::Cors;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;

use reachflow::api;
use reachflow::config::Config;
use reachflow::middleware::auth::TenantAuth;
use reachflow::services::context::AppContext;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to create pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let ctx = web::Data::new(AppContext::new(pool, config));

    println!("🚀 Reachflow API starting on http://0.0.0.0:8080");

    HttpServer::new(move || {
        let frontend_url = env::var("FRONTEND_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "PATCH"])
            .allowed_headers(vec![
                actix_web::http::header::AUTHORIZATION,
                actix_web::http::header::CONTENT_TYPE,
                actix_web::http::header::ACCEPT,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(ctx.clone())
            .wrap(cors)
            .wrap(actix_middleware::Logger::default())
            .wrap(TenantAuth)
            .service(
                web::scope("/api")
                    .configure(api::campaigns::configure)
                    .configure(api::linkedin_accounts::configure),
            )
            .route("/health", web::get().to(|| async { "OK" }))
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}
