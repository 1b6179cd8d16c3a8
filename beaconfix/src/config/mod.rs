//! Configuration file.
//!
//! beaconfix reads an INI file, by default `<config_dir>/beaconfix/config.ini`:
//!
//! ```ini
//! [scan]
//! service_uuid = 12345678-1234-5678-1234-56789abcdef0
//! characteristic_uuid = abcdef12-3456-7890-abcd-ef1234567890
//! timeout_secs = 0
//!
//! [session]
//! connect_timeout_ms = 10000
//! discovery_timeout_ms = 5000
//! read_timeout_ms = 5000
//! rearm_interval_ms = 2000
//!
//! [model]
//! annual_growth_fraction = 0.49
//! propagation_speed = 299792458
//! seconds_per_year = 31556952
//! negative_distance = reject
//!
//! [fusion]
//! threshold = 3
//! degenerate_epsilon = 1e-9
//!
//! [reference]
//! url = https://pro-api.coinmarketcap.com/v1/cryptocurrency/listings/latest
//! symbol = BTC
//! convert = USD
//! api_key_env = BEACONFIX_API_KEY
//! timeout_secs = 10
//!
//! [broadcast]
//! listen = 0.0.0.0:8080
//! heartbeat_ms = 1000
//!
//! [logging]
//! level = info
//! file = /var/log/beaconfix.log
//!
//! [beacon.alpha]
//! x = 0
//! y = 0
//! ```
//!
//! Every key is optional; missing keys take the defaults shown above.
//! [`ConfigFile::pipeline_config`] turns a validated file into the typed
//! [`PipelineConfig`] injected into the core.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::beacon::{Beacon, BeaconSet, BeaconSetError};
use crate::broadcast::BroadcastConfig;
use crate::coord::Point2;
use crate::estimator::{GrowthModel, PathLossModel, DEFAULT_ANNUAL_GROWTH, JULIAN_YEAR_SECS, SPEED_OF_LIGHT};
use crate::fusion::NegativeDistancePolicy;
use crate::logging::LogConfig;
use crate::peripheral::GattUuid;
use crate::pipeline::PipelineConfig;
use crate::session::{SessionTarget, SessionTimeouts};
use crate::trilateration::{ANCHOR_COUNT, DEFAULT_DEGENERATE_EPSILON};

/// Service UUID advertised by beacons.
pub const DEFAULT_SERVICE_UUID: &str = "12345678-1234-5678-1234-56789abcdef0";

/// Characteristic UUID holding the beacon value.
pub const DEFAULT_CHARACTERISTIC_UUID: &str = "abcdef12-3456-7890-abcd-ef1234567890";

/// Default listings endpoint.
pub const DEFAULT_REFERENCE_URL: &str =
    "https://pro-api.coinmarketcap.com/v1/cryptocurrency/listings/latest";

/// Default environment variable holding the listings API key.
pub const DEFAULT_API_KEY_ENV: &str = "BEACONFIX_API_KEY";

/// Default broadcast listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

const BEACON_SECTION_PREFIX: &str = "beacon.";

/// Errors loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid beacon table: {0}")]
    Beacons(#[from] BeaconSetError),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// `[scan]`
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    /// 0 scans until shutdown.
    pub timeout_secs: u64,
}

/// `[session]`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub connect_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub rearm_interval_ms: u64,
}

/// `[model]`
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub annual_growth_fraction: f64,
    pub propagation_speed: f64,
    pub seconds_per_year: f64,
    pub negative_distance: NegativeDistancePolicy,
}

/// `[fusion]`
#[derive(Debug, Clone, PartialEq)]
pub struct FusionSettings {
    pub threshold: usize,
    pub degenerate_epsilon: f64,
}

/// `[reference]`
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSettings {
    pub url: String,
    pub symbol: String,
    pub convert: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

/// `[broadcast]`
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastSettings {
    pub listen: String,
    pub heartbeat_ms: u64,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// One `[beacon.<name>]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconEntry {
    pub name: String,
    pub x: f64,
    pub y: f64,
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub scan: ScanSettings,
    pub session: SessionSettings,
    pub model: ModelSettings,
    pub fusion: FusionSettings,
    pub reference: ReferenceSettings,
    pub broadcast: BroadcastSettings,
    pub logging: LoggingSettings,
    pub beacons: Vec<BeaconEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            scan: ScanSettings {
                service_uuid: DEFAULT_SERVICE_UUID.to_string(),
                characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID.to_string(),
                timeout_secs: 0,
            },
            session: SessionSettings {
                connect_timeout_ms: 10_000,
                discovery_timeout_ms: 5_000,
                read_timeout_ms: 5_000,
                rearm_interval_ms: 2_000,
            },
            model: ModelSettings {
                annual_growth_fraction: DEFAULT_ANNUAL_GROWTH,
                propagation_speed: SPEED_OF_LIGHT,
                seconds_per_year: JULIAN_YEAR_SECS,
                negative_distance: NegativeDistancePolicy::Reject,
            },
            fusion: FusionSettings {
                threshold: ANCHOR_COUNT,
                degenerate_epsilon: DEFAULT_DEGENERATE_EPSILON,
            },
            reference: ReferenceSettings {
                url: DEFAULT_REFERENCE_URL.to_string(),
                symbol: "BTC".to_string(),
                convert: "USD".to_string(),
                api_key_env: DEFAULT_API_KEY_ENV.to_string(),
                timeout_secs: 10,
            },
            broadcast: BroadcastSettings {
                listen: DEFAULT_LISTEN.to_string(),
                heartbeat_ms: 1_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                file: None,
            },
            beacons: vec![
                BeaconEntry::new("alpha", 0.0, 0.0),
                BeaconEntry::new("bravo", 5.0, 0.0),
                BeaconEntry::new("charlie", 2.0, 4.0),
            ],
        }
    }
}

impl BeaconEntry {
    pub fn new(name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            name: name.into(),
            x,
            y,
        }
    }
}

/// Directory holding beaconfix configuration.
pub fn config_directory() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("beaconfix"))
}

/// Default configuration file path.
pub fn config_file_path() -> Option<PathBuf> {
    config_directory().map(|d| d.join("config.ini"))
}

fn parse_value<T>(section: &str, key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Reads typed keys from one section, leaving defaults for missing keys.
struct SectionReader<'a> {
    ini: &'a Ini,
    section: &'a str,
}

impl<'a> SectionReader<'a> {
    fn new(ini: &'a Ini, section: &'a str) -> Self {
        Self { ini, section }
    }

    fn get<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        if let Some(raw) = self.ini.get_from(Some(self.section), key) {
            *target = parse_value(self.section, key, raw)?;
        }
        Ok(())
    }

    fn get_string(&self, key: &str, target: &mut String) {
        if let Some(raw) = self.ini.get_from(Some(self.section), key) {
            *target = raw.trim().to_string();
        }
    }
}

impl ConfigFile {
    /// Load from `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Load from the default path, or defaults if no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let scan = SectionReader::new(ini, "scan");
        scan.get_string("service_uuid", &mut config.scan.service_uuid);
        scan.get_string("characteristic_uuid", &mut config.scan.characteristic_uuid);
        scan.get("timeout_secs", &mut config.scan.timeout_secs)?;

        let session = SectionReader::new(ini, "session");
        session.get("connect_timeout_ms", &mut config.session.connect_timeout_ms)?;
        session.get("discovery_timeout_ms", &mut config.session.discovery_timeout_ms)?;
        session.get("read_timeout_ms", &mut config.session.read_timeout_ms)?;
        session.get("rearm_interval_ms", &mut config.session.rearm_interval_ms)?;

        let model = SectionReader::new(ini, "model");
        model.get("annual_growth_fraction", &mut config.model.annual_growth_fraction)?;
        model.get("propagation_speed", &mut config.model.propagation_speed)?;
        model.get("seconds_per_year", &mut config.model.seconds_per_year)?;
        model.get("negative_distance", &mut config.model.negative_distance)?;

        let fusion = SectionReader::new(ini, "fusion");
        fusion.get("threshold", &mut config.fusion.threshold)?;
        fusion.get("degenerate_epsilon", &mut config.fusion.degenerate_epsilon)?;

        let reference = SectionReader::new(ini, "reference");
        reference.get_string("url", &mut config.reference.url);
        reference.get_string("symbol", &mut config.reference.symbol);
        reference.get_string("convert", &mut config.reference.convert);
        reference.get_string("api_key_env", &mut config.reference.api_key_env);
        reference.get("timeout_secs", &mut config.reference.timeout_secs)?;

        let broadcast = SectionReader::new(ini, "broadcast");
        broadcast.get_string("listen", &mut config.broadcast.listen);
        broadcast.get("heartbeat_ms", &mut config.broadcast.heartbeat_ms)?;

        let logging = SectionReader::new(ini, "logging");
        logging.get_string("level", &mut config.logging.level);
        if let Some(file) = ini.get_from(Some("logging"), "file") {
            let file = file.trim();
            config.logging.file = (!file.is_empty()).then(|| PathBuf::from(file));
        }

        let mut beacons = Vec::new();
        for section in ini.sections().flatten() {
            let Some(name) = section.strip_prefix(BEACON_SECTION_PREFIX) else {
                continue;
            };
            let mut entry = BeaconEntry::new(name, f64::NAN, f64::NAN);
            let r = SectionReader::new(ini, section);
            r.get("x", &mut entry.x)?;
            r.get("y", &mut entry.y)?;
            if entry.x.is_nan() || entry.y.is_nan() {
                return Err(ConfigError::Validation(format!(
                    "[{}] needs both x and y",
                    section
                )));
            }
            beacons.push(entry);
        }
        if !beacons.is_empty() {
            config.beacons = beacons;
        }

        Ok(config)
    }

    /// Render as INI.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some("scan"))
            .set("service_uuid", &self.scan.service_uuid)
            .set("characteristic_uuid", &self.scan.characteristic_uuid)
            .set("timeout_secs", self.scan.timeout_secs.to_string());
        ini.with_section(Some("session"))
            .set("connect_timeout_ms", self.session.connect_timeout_ms.to_string())
            .set("discovery_timeout_ms", self.session.discovery_timeout_ms.to_string())
            .set("read_timeout_ms", self.session.read_timeout_ms.to_string())
            .set("rearm_interval_ms", self.session.rearm_interval_ms.to_string());
        ini.with_section(Some("model"))
            .set("annual_growth_fraction", self.model.annual_growth_fraction.to_string())
            .set("propagation_speed", self.model.propagation_speed.to_string())
            .set("seconds_per_year", self.model.seconds_per_year.to_string())
            .set("negative_distance", self.model.negative_distance.to_string());
        ini.with_section(Some("fusion"))
            .set("threshold", self.fusion.threshold.to_string())
            .set("degenerate_epsilon", self.fusion.degenerate_epsilon.to_string());
        ini.with_section(Some("reference"))
            .set("url", &self.reference.url)
            .set("symbol", &self.reference.symbol)
            .set("convert", &self.reference.convert)
            .set("api_key_env", &self.reference.api_key_env)
            .set("timeout_secs", self.reference.timeout_secs.to_string());
        ini.with_section(Some("broadcast"))
            .set("listen", &self.broadcast.listen)
            .set("heartbeat_ms", self.broadcast.heartbeat_ms.to_string());
        let file = self
            .logging
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        ini.with_section(Some("logging"))
            .set("level", &self.logging.level)
            .set("file", file);
        for beacon in &self.beacons {
            ini.with_section(Some(format!("{}{}", BEACON_SECTION_PREFIX, beacon.name)))
                .set("x", beacon.x.to_string())
                .set("y", beacon.y.to_string());
        }
        ini
    }

    /// Write to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        self.to_ini().write_to_file(path).map_err(write_err)
    }

    /// Build the beacon table.
    pub fn beacon_set(&self) -> Result<BeaconSet, ConfigError> {
        let beacons = self
            .beacons
            .iter()
            .map(|b| Beacon::new(b.name.as_str(), Point2::new(b.x, b.y)));
        Ok(BeaconSet::new(beacons)?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.scan.service_uuid.trim().is_empty() || self.scan.characteristic_uuid.trim().is_empty() {
            return invalid("service and characteristic UUIDs must be set".into());
        }
        if self.fusion.threshold != ANCHOR_COUNT {
            return invalid(format!(
                "fusion threshold must be {}, got {}",
                ANCHOR_COUNT, self.fusion.threshold
            ));
        }
        if self.beacons.len() != self.fusion.threshold {
            return invalid(format!(
                "exactly {} beacons required, {} configured",
                self.fusion.threshold,
                self.beacons.len()
            ));
        }
        self.beacon_set()?;

        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.model.annual_growth_fraction) {
            return invalid("annual_growth_fraction must be positive".into());
        }
        if !positive(self.model.propagation_speed) {
            return invalid("propagation_speed must be positive".into());
        }
        if !positive(self.model.seconds_per_year) {
            return invalid("seconds_per_year must be positive".into());
        }
        let epsilon = self.fusion.degenerate_epsilon;
        if epsilon.is_nan() || epsilon < 0.0 {
            return invalid("degenerate_epsilon must not be negative".into());
        }
        if self.broadcast.heartbeat_ms == 0 {
            return invalid("heartbeat_ms must be greater than zero".into());
        }
        if self.session.connect_timeout_ms == 0
            || self.session.discovery_timeout_ms == 0
            || self.session.read_timeout_ms == 0
        {
            return invalid("session timeouts must be greater than zero".into());
        }
        if self.reference.symbol.trim().is_empty() {
            return invalid("reference symbol must be set".into());
        }
        Ok(())
    }

    /// Growth model described by `[model]`.
    pub fn growth_model(&self) -> GrowthModel {
        GrowthModel::from_annual_fraction(self.model.annual_growth_fraction)
            .with_propagation_speed(self.model.propagation_speed)
            .with_seconds_per_year(self.model.seconds_per_year)
    }

    /// Broadcaster settings described by `[broadcast]`.
    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            heartbeat_interval: Duration::from_millis(self.broadcast.heartbeat_ms),
            ..BroadcastConfig::default()
        }
    }

    /// Logging settings described by `[logging]`.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.logging.level.clone(),
            file: self.logging.file.clone(),
        }
    }

    /// Validate and convert into the typed pipeline configuration.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        self.validate()?;
        Ok(PipelineConfig {
            beacons: self.beacon_set()?,
            target: SessionTarget {
                service: GattUuid::new(&self.scan.service_uuid),
                characteristic: GattUuid::new(&self.scan.characteristic_uuid),
            },
            scan_deadline: (self.scan.timeout_secs > 0)
                .then(|| Duration::from_secs(self.scan.timeout_secs)),
            timeouts: SessionTimeouts {
                connect: Duration::from_millis(self.session.connect_timeout_ms),
                discovery: Duration::from_millis(self.session.discovery_timeout_ms),
                read: Duration::from_millis(self.session.read_timeout_ms),
            },
            rearm_interval: Duration::from_millis(self.session.rearm_interval_ms),
            model: self.growth_model(),
            negative_distance: self.model.negative_distance,
            degenerate_epsilon: self.fusion.degenerate_epsilon,
            symbol: self.reference.symbol.clone(),
            quote_timeout: Duration::from_secs(self.reference.timeout_secs.max(1)),
            path_loss: PathLossModel::default(),
        })
    }
}
