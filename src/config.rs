//! Config can be loaded either from env vars, toml, or json.
//!
//! The config dir holds either `neoinit.toml` or `neoinit.json` (not both). Every setting can be
//! overridden by an env var: `NEOINIT_<SETTING>` e.g. `NEOINIT_TICK_INTERVAL_MS=50`. Lists in env vars
//! are separated by ':'.
//!
//! ### Logging
//! 1. Whether or not to log to disk (and the dir to put the logs in)
//! 1. Whether or not to log to stdout
//! 1. The level to log at
//!
//! ### General config
//! 1. Where to find the unit files (one or more directories)
//! 1. Where to put the notification sockets of the services
//! 1. Where to put the control socket
//! 1. Timing of the supervision: tick interval, restart budget and backoff, kill timeout
//! 1. Size of the worker pool
//! 1. Whether to reap all children or only the known service processes

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "neoinit_";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/neoinit";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_to_stdout: bool,
    pub log_to_disk: bool,
    pub log_dir: PathBuf,
    pub log_level: log::LevelFilter,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub unit_dirs: Vec<PathBuf>,
    pub notifications_dir: PathBuf,
    pub control_socket: PathBuf,
    pub tick_interval: Duration,
    /// A service running for this long gets its restart counter reset
    pub stability_window: Duration,
    /// More restarts than this inside the restart window put a service into FAILED for good
    pub restart_max: u32,
    pub restart_window: Duration,
    pub backoff_cap: Duration,
    /// How long to wait for a process to die after SIGKILL
    pub kill_timeout: Duration,
    pub worker_threads: usize,
    /// Reap every child, not only known service processes. Needed when running as pid 1.
    pub reap_orphans: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            unit_dirs: vec![PathBuf::from("/etc/neoinit/units")],
            notifications_dir: PathBuf::from("/run/neoinit/notify"),
            control_socket: PathBuf::from("/run/neoinit.sock"),
            tick_interval: Duration::from_millis(100),
            stability_window: Duration::from_secs(30),
            restart_max: 3,
            restart_window: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(5),
            worker_threads: 4,
            reap_orphans: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_to_stdout: true,
            log_to_disk: false,
            log_dir: PathBuf::from("/var/log/neoinit"),
            log_level: log::LevelFilter::Info,
        }
    }
}

/// Everything optional so partial files and env vars can be layered
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    unit_dirs: Option<Vec<PathBuf>>,
    notifications_dir: Option<PathBuf>,
    control_socket: Option<PathBuf>,
    tick_interval_ms: Option<u64>,
    stability_window_ms: Option<u64>,
    restart_max: Option<u32>,
    restart_window_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    kill_timeout_ms: Option<u64>,
    worker_threads: Option<usize>,
    reap_orphans: Option<bool>,

    log_to_stdout: Option<bool>,
    log_to_disk: Option<bool>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

fn load_toml(config_path: &Path) -> Result<ConfigFile, String> {
    let content = std::fs::read_to_string(config_path)
        .map_err(|e| format!("Error while opening config file: {}", e))?;
    toml::from_str(&content).map_err(|e| format!("Error while decoding config toml: {}", e))
}

fn load_json(config_path: &Path) -> Result<ConfigFile, String> {
    let file = std::fs::File::open(config_path)
        .map_err(|e| format!("Error while opening config file: {}", e))?;
    serde_json::from_reader(file).map_err(|e| format!("Error while decoding config json: {}", e))
}

fn parse_env_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Could not parse value of env var for {}: {}", key, value))
}

fn apply_env_overrides(
    file: &mut ConfigFile,
    vars: impl Iterator<Item = (String, String)>,
) -> Result<(), String> {
    for (key, value) in vars {
        let key = key.to_lowercase();
        //drop prefix
        let key = match key.strip_prefix(ENV_PREFIX) {
            Some(key) => key.to_owned(),
            None => continue,
        };
        match key.as_str() {
            "unit_dirs" => {
                file.unit_dirs = Some(
                    value
                        .split(':')
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect(),
                )
            }
            "notifications_dir" => file.notifications_dir = Some(PathBuf::from(value)),
            "control_socket" => file.control_socket = Some(PathBuf::from(value)),
            "tick_interval_ms" => file.tick_interval_ms = Some(parse_env_value(&key, &value)?),
            "stability_window_ms" => {
                file.stability_window_ms = Some(parse_env_value(&key, &value)?)
            }
            "restart_max" => file.restart_max = Some(parse_env_value(&key, &value)?),
            "restart_window_ms" => file.restart_window_ms = Some(parse_env_value(&key, &value)?),
            "backoff_cap_ms" => file.backoff_cap_ms = Some(parse_env_value(&key, &value)?),
            "kill_timeout_ms" => file.kill_timeout_ms = Some(parse_env_value(&key, &value)?),
            "worker_threads" => file.worker_threads = Some(parse_env_value(&key, &value)?),
            "reap_orphans" => file.reap_orphans = Some(parse_env_value(&key, &value)?),
            "log_to_stdout" => file.log_to_stdout = Some(parse_env_value(&key, &value)?),
            "log_to_disk" => file.log_to_disk = Some(parse_env_value(&key, &value)?),
            "log_dir" => file.log_dir = Some(PathBuf::from(value)),
            "log_level" => file.log_level = Some(value),
            // the service marker and env vars of other tools share the prefix
            _ => {}
        }
    }
    Ok(())
}

fn build_config(file: &ConfigFile) -> Result<Config, String> {
    let defaults = Config::default();
    let millis = |value: Option<u64>, default: Duration| {
        value.map(Duration::from_millis).unwrap_or(default)
    };
    let config = Config {
        unit_dirs: file.unit_dirs.clone().unwrap_or(defaults.unit_dirs),
        notifications_dir: file
            .notifications_dir
            .clone()
            .unwrap_or(defaults.notifications_dir),
        control_socket: file.control_socket.clone().unwrap_or(defaults.control_socket),
        tick_interval: millis(file.tick_interval_ms, defaults.tick_interval),
        stability_window: millis(file.stability_window_ms, defaults.stability_window),
        restart_max: file.restart_max.unwrap_or(defaults.restart_max),
        restart_window: millis(file.restart_window_ms, defaults.restart_window),
        backoff_cap: millis(file.backoff_cap_ms, defaults.backoff_cap),
        kill_timeout: millis(file.kill_timeout_ms, defaults.kill_timeout),
        worker_threads: file.worker_threads.unwrap_or(defaults.worker_threads),
        reap_orphans: file.reap_orphans.unwrap_or(defaults.reap_orphans),
    };
    if config.tick_interval.as_millis() == 0 {
        return Err("tick_interval_ms must be greater than zero".into());
    }
    if config.worker_threads == 0 {
        return Err("worker_threads must be greater than zero".into());
    }
    Ok(config)
}

fn build_logging_config(file: &ConfigFile) -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        log_to_stdout: file.log_to_stdout.unwrap_or(defaults.log_to_stdout),
        log_to_disk: file.log_to_disk.unwrap_or(defaults.log_to_disk),
        log_dir: file.log_dir.clone().unwrap_or(defaults.log_dir),
        log_level: file
            .log_level
            .as_ref()
            .and_then(|level| level.parse().ok())
            .unwrap_or(defaults.log_level),
    }
}

/// The logging config is always returned so errors in the rest of the config can be reported
pub fn load_config(config_path: &Option<PathBuf>) -> (LoggingConfig, Result<Config, String>) {
    let config_dir = config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
    let config_path_json = config_dir.join("neoinit.json");
    let config_path_toml = config_dir.join("neoinit.toml");

    let loaded = match (config_path_json.exists(), config_path_toml.exists()) {
        (true, true) => Err("Found both json and toml conf!".to_owned()),
        (true, false) => load_json(&config_path_json),
        (false, true) => load_toml(&config_path_toml),
        (false, false) => {
            if config_path.is_none() {
                Ok(ConfigFile::default())
            } else {
                Err("No config file was loaded".to_owned())
            }
        }
    };

    let (mut file, file_error) = match loaded {
        Ok(file) => (file, None),
        Err(e) => (ConfigFile::default(), Some(e)),
    };
    let env_result = apply_env_overrides(&mut file, std::env::vars());

    let logging = build_logging_config(&file);
    let config = match (file_error, env_result) {
        (Some(e), _) => Err(e),
        (None, Err(e)) => Err(e),
        (None, Ok(())) => build_config(&file),
    };
    (logging, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("neoinit.toml"),
            r#"
            unit_dirs = ["/a", "/b"]
            tick_interval_ms = 10
            restart_max = 7
            log_level = "debug"
            "#,
        )
        .unwrap();
        let mut file = load_toml(&dir.path().join("neoinit.toml")).unwrap();
        apply_env_overrides(
            &mut file,
            vec![
                ("NEOINIT_RESTART_MAX".to_owned(), "2".to_owned()),
                ("NEOINIT_UNIT_DIRS".to_owned(), "/c:/d".to_owned()),
                ("UNRELATED".to_owned(), "x".to_owned()),
            ]
            .into_iter(),
        )
        .unwrap();
        let conf = build_config(&file).unwrap();
        assert_eq!(conf.unit_dirs, vec![PathBuf::from("/c"), PathBuf::from("/d")]);
        assert_eq!(conf.tick_interval, Duration::from_millis(10));
        assert_eq!(conf.restart_max, 2);
        assert_eq!(conf.kill_timeout, Config::default().kill_timeout);
        assert_eq!(
            build_logging_config(&file).log_level,
            log::LevelFilter::Debug
        );
    }

    #[test]
    fn both_formats_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("neoinit.toml"), "").unwrap();
        std::fs::write(dir.path().join("neoinit.json"), "{}").unwrap();
        let (_, conf) = load_config(&Some(dir.path().to_path_buf()));
        assert!(conf.is_err());
    }

    #[test]
    fn bad_env_value() {
        let mut file = ConfigFile::default();
        let res = apply_env_overrides(
            &mut file,
            vec![("NEOINIT_TICK_INTERVAL_MS".to_owned(), "soon".to_owned())].into_iter(),
        );
        assert!(res.is_err());
    }
}
