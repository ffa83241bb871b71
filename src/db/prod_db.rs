use std::env;

use crate::db::bcch::series_archive::BcchSeriesArchive;

/// INE unemployment rate, monthly, seasonally unadjusted.
const TSR_UNEMPLOYMENT: &str = "F049.DES.TAS.INE9.10.M";

const BCCH_BASE_URL: &str = "https://si3.bcentral.cl/SieteRestWS/SieteRestWS.ashx";

pub struct ProdDb {}

impl ProdDb {
    pub fn bcch_unemployment() -> BcchSeriesArchive {
        BcchSeriesArchive {
            series_id: TSR_UNEMPLOYMENT.to_string(),
            duckdb_path: env::var("BCCH_DUCKDB_PATH")
                .unwrap_or_else(|_| "bcch_unemployment.duckdb".to_string()),
            base_url: BCCH_BASE_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unemployment_archive_defaults() {
        let archive = ProdDb::bcch_unemployment();
        assert_eq!(archive.series_id, "F049.DES.TAS.INE9.10.M");
        assert!(archive.base_url.starts_with("https://si3.bcentral.cl"));
    }
}
