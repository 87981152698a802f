//! Configuration of the signing server daemon.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};
use log::{error, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use crate::commons::error::IoError;
use crate::constants::{
    AUDIT_LOG_TARGET, HTTP_DEFAULT_POST_LIMIT, SIGNSERVER_ENV_LOG_LEVEL,
    SIGNSERVER_ENV_LOG_TYPE,
};
use crate::server::worker::{WorkerConfig, WorkerType};


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        8080
    }

    fn log_level() -> LevelFilter {
        match env::var(SIGNSERVER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}",
                        SIGNSERVER_ENV_LOG_LEVEL
                    );
                    std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(SIGNSERVER_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(err) => {
                    eprintln!(
                        "Unrecognized value for log type in env var {}: {}",
                        SIGNSERVER_ENV_LOG_TYPE, err
                    );
                    std::process::exit(1);
                }
            },
            _ => LogType::File,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./signserver.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn post_limit() -> u64 {
        HTTP_DEFAULT_POST_LIMIT
    }

    fn key_usage_counter() -> CounterStorage {
        CounterStorage::Disk
    }
}


//------------ Config --------------------------------------------------------

/// The global configuration of the daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    /// The maximum size of a request body in bytes.
    #[serde(default = "ConfigDefaults::post_limit")]
    pub post_limit: u64,

    /// Serve HTTPS instead of plain HTTP.
    #[serde(default)]
    pub https: Option<HttpsConfig>,

    #[serde(default = "ConfigDefaults::key_usage_counter")]
    pub key_usage_counter: CounterStorage,

    /// The archive directory, `data_dir/archive` if missing.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// PKCS#11 libraries by the name workers refer to them with.
    #[serde(default)]
    pub pkcs11_libraries: HashMap<String, PathBuf>,

    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
}

/// The HTTPS part of the configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// Request client certificates issued by these CAs.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
}

/// A worker as given in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct WorkerDefinition {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
    #[serde(default)]
    pub properties: WorkerConfig,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn key_usage_dir(&self) -> PathBuf {
        self.data_dir.join(crate::constants::KEY_USAGE_DIR)
    }

    /// Reads the config from a TOML file.
    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file).map_err(|err| {
            ConfigError::Io(IoError::new(
                format!("Cannot read config file '{}'", file.display()), err
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.verify()?;
        Ok(config)
    }

    /// Checks the config for problems serde does not find.
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError::other("Port number must be >1024"));
        }
        if self.post_limit == 0 {
            return Err(ConfigError::other("post_limit must be larger than 0"));
        }
        let mut ids = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for worker in &self.workers {
            if ids.contains(&worker.id) {
                return Err(ConfigError::Other(format!(
                    "Duplicate worker id {}", worker.id
                )));
            }
            let name = worker.name.to_lowercase();
            if name.is_empty() {
                return Err(ConfigError::Other(format!(
                    "Worker {} has an empty name", worker.id
                )));
            }
            if names.contains(&name) {
                return Err(ConfigError::Other(format!(
                    "Duplicate worker name {}", worker.name
                )));
            }
            ids.push(worker.id);
            names.push(name);
        }
        #[cfg(unix)]
        {
            if self.log_type == LogType::Syslog
                && Facility::from_str(&self.syslog_facility).is_err()
            {
                return Err(ConfigError::other("Invalid syslog_facility"));
            }
        }
        Ok(())
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => {
                Err(ConfigError::other("syslog is only supported on Unix"))
            }
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger().chain(io::stderr()).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init stderr logging: {}", e))
        })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger().chain(file).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {}", e))
        })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("signserverd"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => {
                self.fern_logger().chain(logger).apply().map_err(|e| {
                    ConfigError::Other(format!("Failed to init syslog: {}", e))
                })
            }
            Err(err) => {
                Err(ConfigError::Other(format!(
                    "Cannot connect to syslog: {}", err
                )))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        // the audit log must not be lost to a quiet log level
        let audit_level = self.log_level.max(LevelFilter::Info);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                }
                else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("rustls", framework_level)
            .level_for("tokio_rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("h2", framework_level)
            .level_for("mio", framework_level)
            .level_for("want", framework_level)
            .level_for("r2d2", framework_level)
            .level_for(AUDIT_LOG_TARGET, audit_level)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where D: Deserializer<'de> {
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(IoError),
    Toml(toml::de::Error),
    Other(String),
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => e.fmt(f),
            ConfigError::Toml(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where D: Deserializer<'de> {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ CounterStorage ------------------------------------------------

/// Where key usage counters are kept.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterStorage {
    /// In memory, lost on restart.
    Memory,

    /// In the data directory.
    Disk,
}

impl<'de> Deserialize<'de> for CounterStorage {
    fn deserialize<D>(d: D) -> Result<CounterStorage, D::Error>
    where D: Deserializer<'de> {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "memory" => Ok(CounterStorage::Memory),
            "disk" => Ok(CounterStorage::Disk),
            _ => Err(de::Error::custom(format!(
                "expected \"memory\" or \"disk\", found: \"{}\"",
                string
            ))),
        }
    }
}


//------------ Tests ---------------------------------------------------------
