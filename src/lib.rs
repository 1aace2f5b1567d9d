//! Proximity tracking of reported civic issues and geotagged, size-bounded
//! photo capture.

pub mod capture;
pub mod compression;
pub mod constants;
pub mod events;
pub mod exif_parser;
pub mod geo;
pub mod geocoding;
pub mod geotag;
pub mod issues;
pub mod location;
pub mod logging;
pub mod persistence;
pub mod proximity;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod utils;
