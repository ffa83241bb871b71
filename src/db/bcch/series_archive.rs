// Incremental archive for one BCCh (Banco Central de Chile) time series,
// pulled from the Siete REST web service.
// https://si3.bcentral.cl/SieteRestWS/

use duckdb::{params, Connection};
use jiff::civil::Date;
use jiff::ToSpan;
use log::{info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::secrets::Credentials;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("secrets not configured: {0}")]
    Config(String),
    #[error("failed to fetch data from the BCCh API: {0}")]
    Fetch(String),
    #[error("failed to store observations: {0}")]
    Storage(String),
}

impl SyncError {
    /// Status code reported to the caller.  Upstream failures are a bad
    /// gateway; everything else is on us.
    pub fn status_code(&self) -> u16 {
        match self {
            SyncError::Config(_) => 500,
            SyncError::Fetch(_) => 502,
            SyncError::Storage(_) => 500,
        }
    }
}

impl From<duckdb::Error> for SyncError {
    fn from(e: duckdb::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Fetch(e.to_string())
    }
}

/// One element of the `Series.Obs` array as the API returns it.  Dates come
/// in `DD-MM-YYYY` format and values may be numbers or strings (the API uses
/// the string "NaN" for missing months).
#[derive(Debug, Clone, Deserialize)]
pub struct RawObs {
    #[serde(rename = "indexDateString")]
    pub index_date_string: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(rename = "Series")]
    series: SeriesPayload,
}

#[derive(Debug, Deserialize)]
struct SeriesPayload {
    #[serde(rename = "Obs")]
    obs: Vec<RawObs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub series: String,
    pub date: Date,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct SyncOutcome {
    pub written: Vec<Observation>,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct BcchSeriesArchive {
    pub series_id: String,
    pub duckdb_path: String,
    pub base_url: String,
}

impl BcchSeriesArchive {
    pub fn create_table(&self, conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS observations (
    series VARCHAR NOT NULL,
    date DATE NOT NULL,
    value DOUBLE NOT NULL,
    PRIMARY KEY (series, date)
);
    "#,
        )?;
        Ok(())
    }

    /// The date of the most recent stored observation for this series, or
    /// [None] on a first run.  An empty table is not an error.
    pub fn last_date(&self, conn: &Connection) -> Result<Option<Date>, SyncError> {
        let query = format!(
            r#"
SELECT date
FROM observations
WHERE series = '{}'
ORDER BY date DESC
LIMIT 1;
    "#,
            self.series_id
        );
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query_map([], |row| row.get::<usize, i32>(0))?;
        match rows.next() {
            Some(days) => {
                let n = 719528 + days?;
                let date = Date::ZERO
                    .checked_add(n.days())
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                Ok(Some(date))
            }
            None => Ok(None),
        }
    }

    fn base_params(&self, credentials: &Credentials) -> Vec<(String, String)> {
        vec![
            ("user".to_string(), credentials.user.clone()),
            ("pass".to_string(), credentials.pass.clone()),
            ("timeseries".to_string(), self.series_id.clone()),
            ("function".to_string(), "GetSeries".to_string()),
        ]
    }

    /// Query parameters for the incremental fetch.  With a checkpoint,
    /// request from the day after it; without one, request the full history.
    /// `lastdate` is never set so the window always extends to the present.
    pub fn plan_params(
        &self,
        credentials: &Credentials,
        checkpoint: Option<Date>,
    ) -> Result<Vec<(String, String)>, SyncError> {
        let mut params = self.base_params(credentials);
        if let Some(date) = checkpoint {
            let first = date
                .checked_add(1.day())
                .map_err(|e| SyncError::Fetch(format!("cannot advance checkpoint {}: {}", date, e)))?;
            params.push(("firstdate".to_string(), first.to_string()));
        }
        Ok(params)
    }

    /// GET the series from the web service.  Any non-2xx status, network
    /// failure or unexpected body shape is an upstream fetch error.
    pub fn fetch(&self, params: &[(String, String)]) -> Result<Vec<RawObs>, SyncError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        let response = client.get(&self.base_url).query(params).send()?;
        if !response.status().is_success() {
            return Err(SyncError::Fetch(format!(
                "BCCh API returned {}",
                response.status()
            )));
        }
        let payload: SeriesResponse = response
            .json()
            .map_err(|e| SyncError::Fetch(format!("malformed response body: {}", e)))?;
        Ok(payload.series.obs)
    }

    /// Convert raw observations to (ISO date, f64) pairs.  An observation
    /// with a malformed date or a non-numeric value is skipped with a
    /// warning; it never aborts the batch and is never stored.
    pub fn normalize(&self, raw: Vec<RawObs>) -> (Vec<Observation>, usize) {
        let mut observations = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for obs in raw {
            let date = match Date::strptime("%d-%m-%Y", &obs.index_date_string) {
                Ok(date) => date,
                Err(e) => {
                    warn!(
                        "skipping observation with malformed date '{}': {}",
                        obs.index_date_string, e
                    );
                    skipped += 1;
                    continue;
                }
            };
            let value = match parse_value(&obs.value) {
                Some(value) => value,
                None => {
                    warn!("skipping observation on {} with value {}", date, obs.value);
                    skipped += 1;
                    continue;
                }
            };
            observations.push(Observation {
                series: self.series_id.clone(),
                date,
                value,
            });
        }
        (observations, skipped)
    }

    /// Idempotent per (series, date): re-syncing the same day overwrites.
    pub fn upsert(&self, conn: &Connection, observation: &Observation) -> Result<(), SyncError> {
        conn.execute(
            "INSERT OR REPLACE INTO observations (series, date, value) VALUES (?, CAST(? AS DATE), ?)",
            params![
                observation.series,
                observation.date.to_string(),
                observation.value
            ],
        )?;
        Ok(())
    }

    /// Normalize and write one batch.  Writes are independent; on the first
    /// failure the run stops and earlier writes remain persisted.
    pub fn apply(&self, conn: &Connection, raw: Vec<RawObs>) -> Result<SyncOutcome, SyncError> {
        let (observations, skipped) = self.normalize(raw);
        for obs in &observations {
            self.upsert(conn, obs)?;
        }
        Ok(SyncOutcome {
            written: observations,
            skipped,
        })
    }

    /// The incremental sync: checkpoint -> plan -> fetch -> normalize+write.
    /// No step retries; the first failure terminates the run.
    pub fn sync(
        &self,
        conn: &Connection,
        credentials: &Credentials,
    ) -> Result<SyncOutcome, SyncError> {
        let checkpoint = self.last_date(conn)?;
        match checkpoint {
            Some(date) => info!("last stored observation for {} is {}", self.series_id, date),
            None => info!(
                "no stored observations for {}, requesting full history",
                self.series_id
            ),
        }
        let params = self.plan_params(credentials, checkpoint)?;
        let raw = self.fetch(&params)?;
        info!("received {} observations from the BCCh API", raw.len());
        let outcome = self.apply(conn, raw)?;
        info!(
            "wrote {} observations, skipped {}",
            outcome.written.len(),
            outcome.skipped
        );
        Ok(outcome)
    }

    /// Manual variant: fetch an explicit window instead of deriving one from
    /// the checkpoint.  With both dates [None] this re-fetches everything.
    pub fn refresh_window(
        &self,
        conn: &Connection,
        credentials: &Credentials,
        firstdate: Option<Date>,
        lastdate: Option<Date>,
    ) -> Result<SyncOutcome, SyncError> {
        let mut params = self.base_params(credentials);
        if let Some(date) = firstdate {
            params.push(("firstdate".to_string(), date.to_string()));
        }
        if let Some(date) = lastdate {
            params.push(("lastdate".to_string(), date.to_string()));
        }
        let raw = self.fetch(&params)?;
        self.apply(conn, raw)
    }

    /// Stored observations between two dates, inclusive, in ascending order.
    pub fn get_data(
        &self,
        conn: &Connection,
        start_date: Date,
        end_date: Date,
    ) -> Result<Vec<Observation>, SyncError> {
        let query = format!(
            r#"
SELECT date, value
FROM observations
WHERE series = '{}'
AND date >= '{}'
AND date <= '{}'
ORDER BY date;
    "#,
            self.series_id, start_date, end_date
        );
        let mut stmt = conn.prepare(&query)?;
        let res_iter = stmt.query_map([], |row| {
            let n = 719528 + row.get::<usize, i32>(0)?;
            Ok(Observation {
                series: self.series_id.clone(),
                date: Date::ZERO.checked_add(n.days()).unwrap(),
                value: row.get::<usize, f64>(1)?,
            })
        })?;
        let res: Vec<Observation> = res_iter.collect::<Result<_, _>>()?;
        Ok(res)
    }
}

/// The API serializes values inconsistently: numbers for most months, strings
/// for some vintages, "NaN" for missing data.  Anything that doesn't resolve
/// to a finite f64 is rejected.
fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::prod_db::ProdDb;
    use jiff::civil::date;
    use serde_json::json;
    use std::error::Error;

    fn test_archive() -> BcchSeriesArchive {
        let mut archive = ProdDb::bcch_unemployment();
        archive.duckdb_path = ":memory:".to_string();
        archive
    }

    fn test_credentials() -> Credentials {
        Credentials {
            user: "alice@example.com".to_string(),
            pass: "hunter2".to_string(),
        }
    }

    fn raw(date: &str, value: Value) -> RawObs {
        RawObs {
            index_date_string: date.to_string(),
            value,
        }
    }

    #[test]
    fn plan_without_checkpoint_omits_firstdate() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let params = archive.plan_params(&test_credentials(), None)?;
        assert!(params.iter().all(|(k, _)| k != "firstdate"));
        assert!(params.iter().all(|(k, _)| k != "lastdate"));
        assert!(params.contains(&("function".to_string(), "GetSeries".to_string())));
        assert!(params.contains(&("timeseries".to_string(), archive.series_id.clone())));
        assert!(params.contains(&("user".to_string(), "alice@example.com".to_string())));
        assert!(params.contains(&("pass".to_string(), "hunter2".to_string())));
        Ok(())
    }

    #[test]
    fn plan_with_checkpoint_requests_next_day() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let params = archive.plan_params(&test_credentials(), Some(date(2024, 1, 31)))?;
        assert!(params.contains(&("firstdate".to_string(), "2024-02-01".to_string())));
        assert!(params.iter().all(|(k, _)| k != "lastdate"));

        // never re-fetch the last stored day
        let params = archive.plan_params(&test_credentials(), Some(date(2024, 12, 31)))?;
        assert!(params.contains(&("firstdate".to_string(), "2025-01-01".to_string())));
        Ok(())
    }

    #[test]
    fn normalize_converts_day_month_year() {
        let archive = test_archive();
        let (obs, skipped) = archive.normalize(vec![raw("15-03-2024", json!(7.1))]);
        assert_eq!(skipped, 0);
        assert_eq!(obs[0].date, date(2024, 3, 15));
        assert_eq!(obs[0].value, 7.1);
        assert_eq!(obs[0].series, archive.series_id);
    }

    #[test]
    fn normalize_skips_malformed_dates() {
        let archive = test_archive();
        // an ISO date fed to the DD-MM-YYYY parser must be rejected, not
        // silently turned into a wrong date
        let (obs, skipped) = archive.normalize(vec![
            raw("2024-03-15", json!(7.1)),
            raw("32-01-2024", json!(7.1)),
            raw("01-02-2024", json!(7.1)),
        ]);
        assert_eq!(skipped, 2);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].date, date(2024, 2, 1));
    }

    #[test]
    fn normalize_handles_string_values_and_skips_nan() {
        let archive = test_archive();
        let (obs, skipped) = archive.normalize(vec![
            raw("01-02-2024", json!("7.1")),
            raw("01-03-2024", json!("NaN")),
            raw("01-04-2024", json!(null)),
        ]);
        assert_eq!(skipped, 2);
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].value, 7.1);
    }

    #[test]
    fn last_date_is_none_on_first_run() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;
        assert_eq!(archive.last_date(&conn)?, None);
        Ok(())
    }

    #[test]
    fn last_date_is_max_stored_date() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;
        for d in [date(2023, 11, 1), date(2024, 1, 31), date(2023, 12, 1)] {
            archive.upsert(
                &conn,
                &Observation {
                    series: archive.series_id.clone(),
                    date: d,
                    value: 7.0,
                },
            )?;
        }
        assert_eq!(archive.last_date(&conn)?, Some(date(2024, 1, 31)));
        Ok(())
    }

    #[test]
    fn upsert_is_idempotent() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;
        let obs = Observation {
            series: archive.series_id.clone(),
            date: date(2024, 2, 1),
            value: 7.1,
        };
        archive.upsert(&conn, &obs)?;
        archive.upsert(&conn, &obs)?;
        // a later sync overwrites the same key
        archive.upsert(
            &conn,
            &Observation {
                value: 7.2,
                ..obs.clone()
            },
        )?;
        let rows = archive.get_data(&conn, date(2024, 1, 1), date(2024, 12, 31))?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 7.2);
        Ok(())
    }

    #[test]
    fn apply_writes_new_observations_after_checkpoint() -> Result<(), Box<dyn Error>> {
        let archive = test_archive();
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;
        archive.upsert(
            &conn,
            &Observation {
                series: archive.series_id.clone(),
                date: date(2024, 1, 31),
                value: 7.3,
            },
        )?;
        assert_eq!(archive.last_date(&conn)?, Some(date(2024, 1, 31)));

        // what the API would return for firstdate=2024-02-01
        let outcome = archive.apply(
            &conn,
            vec![raw("01-02-2024", json!(7.1)), raw("02-02-2024", json!(7.0))],
        )?;
        assert_eq!(outcome.written.len(), 2);
        assert_eq!(outcome.skipped, 0);

        let rows = archive.get_data(&conn, date(2024, 2, 1), date(2024, 2, 29))?;
        assert_eq!(
            rows,
            vec![
                Observation {
                    series: archive.series_id.clone(),
                    date: date(2024, 2, 1),
                    value: 7.1
                },
                Observation {
                    series: archive.series_id.clone(),
                    date: date(2024, 2, 2),
                    value: 7.0
                },
            ]
        );
        assert_eq!(archive.last_date(&conn)?, Some(date(2024, 2, 2)));
        Ok(())
    }

    #[test]
    fn sync_fails_with_fetch_error_on_upstream_503() -> Result<(), Box<dyn Error>> {
        use std::io::{Read, Write};

        // one-shot listener answering 503 to whatever arrives
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });

        let mut archive = test_archive();
        archive.base_url = format!("http://{}", addr);
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;

        let err = archive.sync(&conn, &test_credentials()).unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
        assert_eq!(err.status_code(), 502);

        // the run terminated before any store write
        let rows = archive.get_data(&conn, date(1900, 1, 1), date(2100, 1, 1))?;
        assert!(rows.is_empty());
        handle.join().unwrap();
        Ok(())
    }

    #[test]
    fn sync_fails_with_fetch_error_when_unreachable() -> Result<(), Box<dyn Error>> {
        let mut archive = test_archive();
        archive.base_url = "http://127.0.0.1:1/SieteRestWS.ashx".to_string();
        let conn = Connection::open_in_memory()?;
        archive.create_table(&conn)?;

        let err = archive.sync(&conn, &test_credentials()).unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
        Ok(())
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(SyncError::Config("x".to_string()).status_code(), 500);
        assert_eq!(SyncError::Fetch("x".to_string()).status_code(), 502);
        assert_eq!(SyncError::Storage("x".to_string()).status_code(), 500);
    }

    #[ignore]
    #[test]
    fn sync_live() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
        dotenvy::from_path(std::path::Path::new(".env/test.env"))?;
        let credentials = Credentials::load(&crate::secrets::EnvSecretStore)?;
        let archive = ProdDb::bcch_unemployment();
        let conn = Connection::open(&archive.duckdb_path)?;
        archive.create_table(&conn)?;
        let outcome = archive.sync(&conn, &credentials)?;
        println!("wrote {} observations", outcome.written.len());
        Ok(())
    }
}
