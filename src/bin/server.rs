use actix_web::middleware::{self, Logger};
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;
use env_logger::Env;
use log::error;

use siete::api::bcch::unemployment;
use siete::api::bcch::unemployment::AppState;
use siete::secrets::{Credentials, EnvSecretStore};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Port number
    #[arg(short, long, default_value = "8111")]
    port: u16,
}

#[get("/")]
async fn hello() -> impl Responder {
    HttpResponse::Ok().body("BCCh sync server is up.")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let _ = dotenvy::dotenv();

    // Fetch secrets once; a failure here leaves the server in a degraded
    // state where every task invocation returns 500 until a restart.
    let credentials = match Credentials::load(&EnvSecretStore) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            error!("FATAL: could not load BCCh credentials: {}", e);
            None
        }
    };
    let state = web::Data::new(AppState { credentials });

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(middleware::Compress::default())
            .app_data(state.clone())
            .service(hello)
            .service(unemployment::api_sync)
            .service(unemployment::api_refresh)
            .service(unemployment::api_observations)
    })
    .bind(("127.0.0.1", args.port))?
    .run()
    .await
}
