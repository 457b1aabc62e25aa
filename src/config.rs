//! Daemon configuration: a single `config.toml` plus a directory of
//! per-policy files (see [`crate::policy`]).
//!
//! Values that can change on `SIGHUP` are wrapped in [`Reloadable`], an
//! `ArcSwap`-backed cell so a reload never tears down in-flight work.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

//----------- Reloadable ------------------------------------------------------------

/// A value that can be hot-swapped on configuration reload without
/// disturbing readers already holding a snapshot.
#[derive(Debug)]
pub struct Reloadable<T>(ArcSwap<T>);

impl<T> Reloadable<T> {
    pub fn new(value: T) -> Self {
        Reloadable(ArcSwap::from_pointee(value))
    }

    /// The current value, as an independent `Arc` snapshot.
    pub fn value(&self) -> Arc<T> {
        self.0.load_full()
    }

    pub fn store(&self, value: T) {
        self.0.store(Arc::new(value));
    }
}

impl<T: Clone> Clone for Reloadable<T> {
    fn clone(&self) -> Self {
        Reloadable::new((*self.value()).clone())
    }
}

impl<T: Default> Default for Reloadable<T> {
    fn default() -> Self {
        Reloadable::new(T::default())
    }
}

//----------- Config -----------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub policy_dir: Utf8PathBuf,
    pub state_file: Utf8PathBuf,
    pub command_socket: Utf8PathBuf,
    pub signconf_dir: Utf8PathBuf,
    pub signer_notify_command: Option<Box<str>>,
    pub scheduler_workers: usize,
}

impl Config {
    pub fn init_from_file(&mut self, path: &Utf8Path) -> std::io::Result<()> {
        let text = std::fs::read_to_string(path)?;
        let spec: ConfigSpec = toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        spec.apply(self);
        Ok(())
    }
}

//----------- DaemonConfig -----------------------------------------------------------

#[derive(Debug, Default)]
pub struct DaemonConfig {
    pub pid_file: Option<Box<Utf8Path>>,
    pub identity: Option<(UserId, GroupId)>,
    pub daemonize: Reloadable<bool>,
    pub logging: LoggingConfig,
}

impl Clone for DaemonConfig {
    fn clone(&self) -> Self {
        DaemonConfig {
            pid_file: self.pid_file.clone(),
            identity: self.identity.clone(),
            daemonize: Reloadable::new(*self.daemonize.value()),
            logging: self.logging.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserId {
    Named(Box<str>),
    Numeric(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupId {
    Named(Box<str>),
    Numeric(u32),
}

//----------- LoggingConfig -----------------------------------------------------------

#[derive(Debug)]
pub struct LoggingConfig {
    pub level: Reloadable<LogLevel>,
    pub target: Reloadable<LogTarget>,
    pub trace_targets: Reloadable<Vec<Box<str>>>,
}

impl Clone for LoggingConfig {
    fn clone(&self) -> Self {
        LoggingConfig {
            level: Reloadable::new(*self.level.value()),
            target: Reloadable::new((*self.target.value()).clone()),
            trace_targets: Reloadable::new((*self.trace_targets.value()).clone()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Reloadable::new(LogLevel::Info),
            target: Reloadable::new(LogTarget::Stderr),
            trace_targets: Reloadable::new(Vec::new()),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "type", content = "path")]
pub enum LogTarget {
    File(Box<Utf8Path>),
    Syslog,
    Stdout,
    Stderr,
}

//----------- ConfigSpec (TOML) -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigSpec {
    pub pid_file: Option<Utf8PathBuf>,
    pub user: Option<Box<str>>,
    pub group: Option<Box<str>>,
    pub daemonize: bool,
    pub policy_dir: Utf8PathBuf,
    pub state_file: Utf8PathBuf,
    pub command_socket: Utf8PathBuf,
    pub signconf_dir: Utf8PathBuf,
    pub signer_notify_command: Option<Box<str>>,
    pub scheduler_workers: usize,
    pub log_level: LogLevel,
    pub log_target: LogTarget,
    pub trace_targets: Vec<Box<str>>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        ConfigSpec {
            pid_file: Some(Utf8PathBuf::from(enforcerd_cfg::DEFAULT_PID_FILE)),
            user: None,
            group: None,
            daemonize: false,
            policy_dir: Utf8PathBuf::from(enforcerd_cfg::DEFAULT_POLICY_DIR),
            state_file: Utf8PathBuf::from(enforcerd_cfg::DEFAULT_STATE_FILE),
            command_socket: Utf8PathBuf::from(enforcerd_cfg::DEFAULT_COMMAND_SOCKET),
            signconf_dir: Utf8PathBuf::from(enforcerd_cfg::DEFAULT_SIGNCONF_DIR),
            signer_notify_command: None,
            scheduler_workers: 4,
            log_level: LogLevel::Info,
            log_target: LogTarget::Stderr,
            trace_targets: Vec::new(),
        }
    }
}

impl ConfigSpec {
    pub fn apply(self, config: &mut Config) {
        config.daemon.pid_file = self.pid_file.map(|p| p.into_boxed_path());
        config.daemon.identity = match (self.user, self.group) {
            (Some(user), Some(group)) => Some((UserId::Named(user), GroupId::Named(group))),
            _ => None,
        };
        config.daemon.daemonize.store(self.daemonize);
        config.daemon.logging.level.store(self.log_level);
        config.daemon.logging.target.store(self.log_target);
        config.daemon.logging.trace_targets.store(self.trace_targets);
        config.policy_dir = self.policy_dir;
        config.state_file = self.state_file;
        config.command_socket = self.command_socket;
        config.signconf_dir = self.signconf_dir;
        config.signer_notify_command = self.signer_notify_command;
        config.scheduler_workers = self.scheduler_workers.max(1);
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Config {
            daemon: DaemonConfig::default(),
            policy_dir: Utf8PathBuf::new(),
            state_file: Utf8PathBuf::new(),
            command_socket: Utf8PathBuf::new(),
            signconf_dir: Utf8PathBuf::new(),
            signer_notify_command: None,
            scheduler_workers: 4,
        };
        ConfigSpec::default().apply(&mut config);
        config
    }
}

/// Backoff parameters for the scheduler (§4.6), kept alongside config for
/// now since there is no dedicated policy for it.
pub const SCHEDULER_BASE_BACKOFF: Duration = Duration::from_secs(5);
pub const SCHEDULER_MAX_BACKOFF: Duration = Duration::from_secs(3600);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_spec_parses_back() {
        let spec = ConfigSpec::default();
        let text = toml::to_string_pretty(&spec).unwrap();
        let _back: ConfigSpec = toml::from_str(&text).unwrap();
    }

    #[test]
    fn reloadable_store_is_visible_to_new_loads() {
        let r = Reloadable::new(LogLevel::Info);
        r.store(LogLevel::Debug);
        assert_eq!(*r.value(), LogLevel::Debug);
    }
}
