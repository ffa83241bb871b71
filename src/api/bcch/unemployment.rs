use actix_web::{get, web, HttpResponse, Responder};
use duckdb::{AccessMode, Config, Connection};
use jiff::civil::Date;
use log::error;
use serde::Deserialize;
use serde_json::json;

use crate::db::bcch::series_archive::{Observation, SyncError, SyncOutcome};
use crate::db::prod_db::ProdDb;
use crate::secrets::Credentials;

/// Process-wide immutable state, initialized once at server start.  A [None]
/// credentials field means the secret fetch failed at startup; every task
/// invocation then returns 500 until the process is restarted.
pub struct AppState {
    pub credentials: Option<Credentials>,
}

/// Incremental sync: derive the fetch window from the last stored date.
/// http://127.0.0.1:8111/bcch/unemployment/sync
#[get("/bcch/unemployment/sync")]
pub async fn api_sync(state: web::Data<AppState>) -> impl Responder {
    let credentials = match state.credentials.clone() {
        Some(credentials) => credentials,
        None => return degraded_response(),
    };
    let res = web::block(move || {
        let archive = ProdDb::bcch_unemployment();
        let conn = Connection::open(&archive.duckdb_path)?;
        archive.create_table(&conn)?;
        archive.sync(&conn, &credentials)
    })
    .await;
    task_response(res)
}

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    pub firstdate: Option<Date>,
    pub lastdate: Option<Date>,
}

/// Manual refresh over an explicit window, ignoring the checkpoint.
/// http://127.0.0.1:8111/bcch/unemployment/refresh?firstdate=2024-01-01&lastdate=2024-06-30
#[get("/bcch/unemployment/refresh")]
pub async fn api_refresh(
    state: web::Data<AppState>,
    query: web::Query<RefreshQuery>,
) -> impl Responder {
    let credentials = match state.credentials.clone() {
        Some(credentials) => credentials,
        None => return degraded_response(),
    };
    let firstdate = query.firstdate;
    let lastdate = query.lastdate;
    let res = web::block(move || {
        let archive = ProdDb::bcch_unemployment();
        let conn = Connection::open(&archive.duckdb_path)?;
        archive.create_table(&conn)?;
        archive.refresh_window(&conn, &credentials, firstdate, lastdate)
    })
    .await;
    task_response(res)
}

/// Stored observations between two dates, inclusive.
/// http://127.0.0.1:8111/bcch/unemployment/start/2024-01-01/end/2024-06-30
#[get("/bcch/unemployment/start/{start}/end/{end}")]
pub async fn api_observations(path: web::Path<(Date, Date)>) -> impl Responder {
    let (start, end) = path.into_inner();
    match read_observations(start, end) {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(&e),
    }
}

fn read_observations(
    start: Date,
    end: Date,
) -> Result<Vec<Observation>, SyncError> {
    let archive = ProdDb::bcch_unemployment();
    let config = Config::default()
        .access_mode(AccessMode::ReadOnly)
        .map_err(|e| SyncError::Storage(e.to_string()))?;
    let conn = Connection::open_with_flags(&archive.duckdb_path, config)?;
    archive.get_data(&conn, start, end)
}

fn degraded_response() -> HttpResponse {
    error_response(&SyncError::Config(
        "credentials unavailable since startup".to_string(),
    ))
}

fn task_response(
    res: Result<Result<SyncOutcome, SyncError>, actix_web::error::BlockingError>,
) -> HttpResponse {
    match res {
        Ok(Ok(outcome)) => HttpResponse::Ok().json(json!({
            "message": format!(
                "Successfully fetched and stored data for timeseries: {}",
                ProdDb::bcch_unemployment().series_id
            ),
            "retrieved_data": outcome.written,
            "skipped": outcome.skipped,
        })),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("sync task did not complete: {}", e);
            HttpResponse::InternalServerError().json(json!({"error": "Internal error."}))
        }
    }
}

/// Map the error taxonomy to the response contract.  Details go to the log;
/// the body carries a short message only.
fn error_response(e: &SyncError) -> HttpResponse {
    error!("{}", e);
    let message = match e {
        SyncError::Config(_) => "Secrets not configured. Check server logs.",
        SyncError::Fetch(_) => "Failed to fetch data from external API.",
        SyncError::Storage(_) => "Failed to store data in DuckDB.",
    };
    let body = json!({ "error": message });
    match e.status_code() {
        502 => HttpResponse::BadGateway().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}
