use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{UNKNOWN_LOCATION, USER_AGENT};
use crate::geo::Coordinate;

/// Human-readable address for a coordinate. `formatted` is never empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub formatted: String,
    pub road: String,
    pub locality: String,
    pub area: String,
    pub state: String,
    pub country: String,
    pub postcode: String,
}

impl AddressRecord {
    /// Builds a record and its `formatted` line from whichever parts are present.
    /// Returns `None` when every part is empty.
    pub fn from_parts(
        road: String,
        locality: String,
        area: String,
        state: String,
        postcode: String,
        country: String,
    ) -> Option<Self> {
        let formatted = join_non_empty(&[&road, &locality, &area, &state, &postcode, &country]);
        if formatted.is_empty() {
            return None;
        }
        Some(Self {
            formatted,
            road,
            locality,
            area,
            state,
            country,
            postcode,
        })
    }

    /// Last-resort address when no provider answers.
    pub fn synthetic(coordinate: Coordinate) -> Self {
        Self {
            formatted: coordinate.to_string(),
            area: UNKNOWN_LOCATION.to_string(),
            ..Default::default()
        }
    }
}

pub(crate) fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Address components as both OpenCage (`components`) and Nominatim
/// (`address`) name them. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddressComponents {
    road: Option<String>,
    pedestrian: Option<String>,
    neighbourhood: Option<String>,
    suburb: Option<String>,
    city_district: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
    country: Option<String>,
}

fn first_present(candidates: &[&Option<String>]) -> String {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

impl AddressComponents {
    fn into_record(self, road_candidates: &[&Option<String>]) -> Option<AddressRecord> {
        AddressRecord::from_parts(
            first_present(road_candidates),
            first_present(&[&self.suburb, &self.city_district]),
            first_present(&[&self.city, &self.town, &self.village]),
            first_present(&[&self.state]),
            first_present(&[&self.postcode]),
            first_present(&[&self.country]),
        )
    }

    fn opencage_record(self) -> Option<AddressRecord> {
        let road = self.road.clone();
        let neighbourhood = self.neighbourhood.clone();
        self.into_record(&[&road, &neighbourhood])
    }

    fn nominatim_record(self) -> Option<AddressRecord> {
        let road = self.road.clone();
        let pedestrian = self.pedestrian.clone();
        let neighbourhood = self.neighbourhood.clone();
        self.into_record(&[&road, &pedestrian, &neighbourhood])
    }
}

/// One reverse-geocoding backend: how to ask, and how to read the answer.
/// `parse` returns `None` for an empty or unusable answer, which moves the
/// resolver on to the next provider.
pub trait AddressProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn request_url(&self, coordinate: Coordinate) -> String;
    fn parse(&self, body: &[u8]) -> Option<AddressRecord>;
}

#[derive(Debug, Default, Deserialize)]
struct OpenCageResponse {
    #[serde(default)]
    results: Vec<OpenCageResult>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenCageResult {
    #[serde(default)]
    components: AddressComponents,
}

/// Keyed commercial geocoder (OpenCage Data).
pub struct OpenCageProvider {
    base_url: String,
    api_key: String,
}

impl OpenCageProvider {
    pub const DEFAULT_URL: &'static str = "https://api.opencagedata.com/geocode/v1/json";

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl AddressProvider for OpenCageProvider {
    fn name(&self) -> &'static str {
        "opencage"
    }

    fn request_url(&self, c: Coordinate) -> String {
        format!(
            "{}?q={}+{}&key={}&language=en",
            self.base_url, c.latitude, c.longitude, self.api_key
        )
    }

    fn parse(&self, body: &[u8]) -> Option<AddressRecord> {
        let response: OpenCageResponse = serde_json::from_slice(body).ok()?;
        response.results.into_iter().next()?.components.opencage_record()
    }
}

#[derive(Debug, Default, Deserialize)]
struct NominatimResponse {
    address: Option<AddressComponents>,
}

/// Free public geocoder (OpenStreetMap Nominatim).
pub struct NominatimProvider {
    base_url: String,
}

impl NominatimProvider {
    pub const DEFAULT_URL: &'static str = "https://nominatim.openstreetmap.org/reverse";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl AddressProvider for NominatimProvider {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    fn request_url(&self, c: Coordinate) -> String {
        format!(
            "{}?format=json&lat={}&lon={}&zoom=18&addressdetails=1",
            self.base_url, c.latitude, c.longitude
        )
    }

    fn parse(&self, body: &[u8]) -> Option<AddressRecord> {
        let response: NominatimResponse = serde_json::from_slice(body).ok()?;
        response.address?.nominatim_record()
    }
}

/// Tries each provider in order; falls back to a synthetic address.
pub struct ReverseGeocoder {
    client: reqwest::Client,
    providers: Vec<Box<dyn AddressProvider>>,
}

impl ReverseGeocoder {
    pub fn new(providers: Vec<Box<dyn AddressProvider>>, timeout: Duration) -> Result<Self> {
        Self::with_user_agent(providers, timeout, USER_AGENT)
    }

    /// Nominatim's usage policy asks for an identifying user agent.
    pub fn with_user_agent(
        providers: Vec<Box<dyn AddressProvider>>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build geocoding HTTP client")?;
        Ok(Self { client, providers })
    }

    /// Provider chain from settings: OpenCage (only with an API key), then Nominatim.
    pub fn from_settings(settings: &crate::settings::GeocodingSettings) -> Result<Self> {
        let mut providers: Vec<Box<dyn AddressProvider>> = Vec::new();
        match settings.opencage_api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => providers.push(Box::new(OpenCageProvider::new(&settings.opencage_url, key))),
            None => info!("No OpenCage API key configured, using Nominatim only"),
        }
        providers.push(Box::new(NominatimProvider::new(&settings.nominatim_url)));
        Self::with_user_agent(
            providers,
            Duration::from_secs(settings.timeout_secs),
            &settings.user_agent,
        )
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Never fails: the last tier is synthesised from the coordinate.
    pub async fn resolve_address(&self, coordinate: Coordinate) -> AddressRecord {
        for provider in &self.providers {
            match self.query(provider.as_ref(), coordinate).await {
                Ok(Some(record)) => {
                    debug!("{} resolved {} to '{}'", provider.name(), coordinate, record.formatted);
                    return record;
                }
                Ok(None) => warn!("{} returned no address for {}", provider.name(), coordinate),
                Err(e) => warn!("{} lookup failed for {}: {:#}", provider.name(), coordinate, e),
            }
        }

        warn!("All geocoding providers failed for {}, using coordinates", coordinate);
        AddressRecord::synthetic(coordinate)
    }

    async fn query(&self, provider: &dyn AddressProvider, coordinate: Coordinate) -> Result<Option<AddressRecord>> {
        let response = self
            .client
            .get(provider.request_url(coordinate))
            .send()
            .await
            .context("request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP status {}", status);
        }

        let body = response.bytes().await.context("failed to read body")?;
        Ok(provider.parse(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENCAGE_BODY: &str = r#"{
        "results": [{
            "components": {
                "neighbourhood": "Shivaji Nagar",
                "suburb": "Central",
                "city": "Bengaluru",
                "town": "ignored",
                "state": "Karnataka",
                "postcode": "560001",
                "country": "India"
            }
        }]
    }"#;

    const NOMINATIM_BODY: &str = r#"{
        "display_name": "whatever",
        "address": {
            "pedestrian": "Church Street",
            "city_district": "East",
            "village": "Halli",
            "country": "India"
        }
    }"#;

    #[test]
    fn opencage_prefers_fields_in_order() {
        let provider = OpenCageProvider::new(OpenCageProvider::DEFAULT_URL, "key");
        let record = provider.parse(OPENCAGE_BODY.as_bytes()).unwrap();
        assert_eq!(record.road, "Shivaji Nagar");
        assert_eq!(record.locality, "Central");
        assert_eq!(record.area, "Bengaluru");
        assert_eq!(
            record.formatted,
            "Shivaji Nagar, Central, Bengaluru, Karnataka, 560001, India"
        );
    }

    #[test]
    fn nominatim_tolerates_missing_fields() {
        let provider = NominatimProvider::new(NominatimProvider::DEFAULT_URL);
        let record = provider.parse(NOMINATIM_BODY.as_bytes()).unwrap();
        assert_eq!(record.road, "Church Street");
        assert_eq!(record.locality, "East");
        assert_eq!(record.area, "Halli");
        assert_eq!(record.state, "");
        assert_eq!(record.formatted, "Church Street, East, Halli, India");
    }

    #[test]
    fn empty_answers_fall_through() {
        let opencage = OpenCageProvider::new("u", "k");
        assert!(opencage.parse(br#"{"results": []}"#).is_none());
        assert!(opencage.parse(br#"{"results": [{"components": {}}]}"#).is_none());
        assert!(opencage.parse(b"not json").is_none());

        let nominatim = NominatimProvider::new("u");
        assert!(nominatim.parse(br#"{"error": "Unable to geocode"}"#).is_none());
    }

    #[test]
    fn synthetic_address_uses_four_decimals() {
        let record = AddressRecord::synthetic(Coordinate::new(12.9716, 77.5946));
        assert_eq!(record.formatted, "12.9716, 77.5946");
        assert_eq!(record.area, "Unknown Location");
        assert!(record.road.is_empty());
    }

    #[test]
    fn request_urls_carry_coordinates() {
        let c = Coordinate::new(12.5, 77.25);
        assert_eq!(
            OpenCageProvider::new("https://oc", "abc").request_url(c),
            "https://oc?q=12.5+77.25&key=abc&language=en"
        );
        assert!(NominatimProvider::new("https://nm")
            .request_url(c)
            .starts_with("https://nm?format=json&lat=12.5&lon=77.25"));
    }

    #[tokio::test]
    async fn unreachable_providers_yield_synthetic_address() {
        let geocoder = ReverseGeocoder::new(
            vec![
                Box::new(OpenCageProvider::new("http://127.0.0.1:9/geocode", "k")),
                Box::new(NominatimProvider::new("http://127.0.0.1:9/reverse")),
            ],
            Duration::from_secs(2),
        )
        .unwrap();

        let record = geocoder.resolve_address(Coordinate::new(12.9716, 77.5946)).await;
        assert_eq!(record.formatted, "12.9716, 77.5946");
        assert_eq!(record.area, UNKNOWN_LOCATION);
    }
}
