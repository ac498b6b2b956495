use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::error::AppError;

/// Thin proxy to the mapy.cz geocoding API so the API key stays server-side.
#[derive(Clone)]
pub struct GeocodeService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeocodeService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn geocode_url(&self, query: &str) -> Result<Url, AppError> {
        let mut url = self.endpoint("geocode")?;
        url.query_pairs_mut().append_pair("query", query);
        Ok(url)
    }

    pub fn reverse_geocode_url(&self, lat: f64, lon: f64) -> Result<Url, AppError> {
        let mut url = self.endpoint("rgeocode")?;
        url.query_pairs_mut()
            .append_pair("lat", &lat.to_string())
            .append_pair("lon", &lon.to_string());
        Ok(url)
    }

    pub async fn geocode(&self, query: &str) -> Result<Value, AppError> {
        let url = self.geocode_url(query)?;
        self.fetch(url, "Geocoding failed").await
    }

    pub async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<Value, AppError> {
        let url = self.reverse_geocode_url(lat, lon)?;
        self.fetch(url, "Reverse geocoding failed").await
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        let base = self.base_url.trim_end_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|err| AppError::Config(format!("invalid MAPY_CZ_BASE_URL: {err}")))
    }

    async fn fetch(&self, url: Url, failure: &str) -> Result<Value, AppError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .header("Api-Key", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "{failure}");
            return Err(AppError::Upstream(failure.to_string()));
        }

        Ok(response.json().await?)
    }
}
