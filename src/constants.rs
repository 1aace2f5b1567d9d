// Proximity
pub const DEFAULT_PROXIMITY_RADIUS_M: f64 = 30.0;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 25;
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// Positioning (mirrors the browser geolocation options used by the mobile client)
pub const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOCATION_MAX_AGE_MS: u64 = 60_000;
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 2_000;

// Fallback coordinate when no position can be obtained (New Delhi)
pub const DEFAULT_LATITUDE: f64 = 28.6139;
pub const DEFAULT_LONGITUDE: f64 = 77.2090;

// Image budget
pub const KIB: usize = 1024;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 500 * KIB;
pub const DEFAULT_COMPRESS_THRESHOLD_BYTES: usize = 100 * KIB;
pub const MAX_COMPRESSION_ATTEMPTS: u32 = 5;
pub const GEOTAG_JPEG_QUALITY: u8 = 95;

// Geotag overlay
pub const GEOTAG_MIN_FONT_PX: u32 = 18;
pub const GEOTAG_MAX_FONT_PX: u32 = 28;
pub const GEOTAG_PADDING_PX: u32 = 20;
pub const GEOTAG_CORNER_RADIUS_PX: u32 = 12;
pub const GEOTAG_HEADER: &str = "GPS Map Camera";
pub const UNKNOWN_LOCATION: &str = "Unknown Location";

// HTTP
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
pub const USER_AGENT: &str = concat!("civic_proximity/", env!("CARGO_PKG_VERSION"));
