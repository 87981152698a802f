//! Various server-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `signserverd` binary.
pub const SIGNSERVER_SERVER_APP: &str = "SignServer";

/// The version of the server code.
pub const SIGNSERVER_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
pub const SIGNSERVER_DEFAULT_CONFIG_FILE: &str = "/etc/signserver.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the path to the config file.
pub const SIGNSERVER_ENV_CONFIG: &str = "SIGNSERVER_CONFIG";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const SIGNSERVER_ENV_LOG_LEVEL: &str = "SIGNSERVER_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::daemon::config::LogType]. It will be overwritten by
/// the config file. The default is “file.”
pub const SIGNSERVER_ENV_LOG_TYPE: &str = "SIGNSERVER_LOG_TYPE";


//------------ Log Targets --------------------------------------------------

/// The log target used for the worker audit log.
pub const AUDIT_LOG_TARGET: &str = "signserver::audit";


//------------ Data Directories ---------------------------------------------

/// The sub directory of the data dir holding key usage counters.
pub const KEY_USAGE_DIR: &str = "keyusage";

/// The sub directory of the data dir holding archived requests.
pub const ARCHIVE_DIR: &str = "archive";


//------------ HTTP ---------------------------------------------------------

/// The path prefix of the process end points.
pub const HTTP_PROCESS_PATH: &str = "/signserver/process";

/// The path prefix of the per-worker end points.
pub const HTTP_WORKER_PATH: &str = "/signserver/worker/";

/// The path of the health check end point.
pub const HTTP_HEALTH_PATH: &str = "/healthcheck";

/// Query parameter prefix carrying request metadata.
pub const HTTP_REQUEST_METADATA_PREFIX: &str = "REQUEST_METADATA.";

/// Response header with the archive id of a processed request.
pub const HTTP_HEADER_ARCHIVE_ID: &str = "X-SignServer-Archive-Id";

/// Response header with the request id of a processed request.
pub const HTTP_HEADER_REQUEST_ID: &str = "X-SignServer-Request-Id";

/// The default limit for request bodies.
pub const HTTP_DEFAULT_POST_LIMIT: u64 = 32 * 1024 * 1024;
