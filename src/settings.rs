use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::capture::CaptureConfig;
use crate::constants::*;
use crate::geo::Coordinate;
use crate::geocoding::{NominatimProvider, OpenCageProvider};
use crate::location::{DeviceProvider, IpApiProvider, LocationConfig, StaticProvider};
use crate::scheduler::SchedulerConfig;

/// Overrides `issues.api_url` at load time.
pub const ISSUES_URL_ENV: &str = "CIVIC_ISSUES_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub proximity: ProximitySettings,
    pub location: LocationSettings,
    pub geocoding: GeocodingSettings,
    pub capture: CaptureSettings,
    pub issues: IssuesSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximitySettings {
    pub radius_m: f64,
    pub refresh_interval_secs: u64,
}

impl Default for ProximitySettings {
    fn default() -> Self {
        Self {
            radius_m: DEFAULT_PROXIMITY_RADIUS_M,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Coarse IP geolocation.
    Ip,
    /// Fixed coordinates from `static_latitude`/`static_longitude`.
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub max_age_ms: u64,
    pub watch_interval_ms: u64,
    pub provider: ProviderKind,
    pub ip_api_url: String,
    pub static_latitude: f64,
    pub static_longitude: f64,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: DEFAULT_LOCATION_TIMEOUT_MS,
            max_age_ms: DEFAULT_LOCATION_MAX_AGE_MS,
            watch_interval_ms: DEFAULT_WATCH_INTERVAL_MS,
            provider: ProviderKind::Ip,
            ip_api_url: IpApiProvider::DEFAULT_URL.to_string(),
            static_latitude: DEFAULT_LATITUDE,
            static_longitude: DEFAULT_LONGITUDE,
        }
    }
}

impl LocationSettings {
    pub fn config(&self) -> LocationConfig {
        LocationConfig {
            high_accuracy: self.high_accuracy,
            timeout_ms: self.timeout_ms,
            max_age_ms: self.max_age_ms,
            watch_interval_ms: self.watch_interval_ms,
        }
    }

    pub fn provider(&self) -> Result<DeviceProvider> {
        Ok(match self.provider {
            ProviderKind::Ip => DeviceProvider::IpApi(
                IpApiProvider::new(&self.ip_api_url).context("Failed to set up IP geolocation")?,
            ),
            ProviderKind::Static => DeviceProvider::Static(StaticProvider {
                coordinate: Coordinate::new(self.static_latitude, self.static_longitude),
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingSettings {
    /// OpenCage is skipped when no key is set.
    pub opencage_api_key: Option<String>,
    pub opencage_url: String,
    pub nominatim_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for GeocodingSettings {
    fn default() -> Self {
        Self {
            opencage_api_key: None,
            opencage_url: OpenCageProvider::DEFAULT_URL.to_string(),
            nominatim_url: NominatimProvider::DEFAULT_URL.to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub max_image_bytes: usize,
    pub compress_threshold_bytes: usize,
    pub geotag_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            compress_threshold_bytes: DEFAULT_COMPRESS_THRESHOLD_BYTES,
            geotag_quality: GEOTAG_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuesSettings {
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for IssuesSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api/issues".to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_dir: Option<PathBuf>,
}

/// Something worth reporting while reading the config file. Settings are
/// loaded before the log subscriber exists, so these are logged afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadNote {
    Defaulted { path: PathBuf },
    Unparsable { path: PathBuf, error: String },
    IssuesUrlOverride { url: String },
}

impl LoadNote {
    pub fn log(&self) {
        match self {
            LoadNote::Defaulted { path } => info!("No config at {}, using defaults", path.display()),
            LoadNote::Unparsable { path, error } => {
                warn!("Failed to parse {}: {}. Using defaults.", path.display(), error)
            }
            LoadNote::IssuesUrlOverride { url } => {
                info!("Issues endpoint overridden by {}: {}", ISSUES_URL_ENV, url)
            }
        }
    }
}

impl Settings {
    pub fn load() -> Result<(Self, Vec<LoadNote>)> {
        Self::load_from(&Self::config_path())
    }

    /// Missing file means defaults; an unparsable one is replaced by
    /// defaults and reported in the returned notes.
    pub fn load_from(path: &Path) -> Result<(Self, Vec<LoadNote>)> {
        let mut notes = Vec::new();
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content).unwrap_or_else(|e: toml::de::Error| {
                notes.push(LoadNote::Unparsable {
                    path: path.to_path_buf(),
                    error: e.message().to_string(),
                });
                Settings::default()
            })
        } else {
            notes.push(LoadNote::Defaulted {
                path: path.to_path_buf(),
            });
            Settings::default()
        };

        notes.extend(settings.apply_env_overrides());
        Ok((settings, notes))
    }

    pub fn apply_env_overrides(&mut self) -> Option<LoadNote> {
        let url = std::env::var(ISSUES_URL_ENV).ok().filter(|u| !u.trim().is_empty())?;
        self.issues.api_url = url.clone();
        Some(LoadNote::IssuesUrlOverride { url })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            crate::utils::ensure_dir(parent)?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).context("Failed to write to config file")?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        crate::utils::config_path()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.proximity.refresh_interval_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.refresh_interval(),
            location: self.location.config(),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            max_image_bytes: self.capture.max_image_bytes,
            compress_threshold_bytes: self.capture.compress_threshold_bytes,
            geotag_quality: self.capture.geotag_quality,
            location: self.location.config(),
        }
    }
}
