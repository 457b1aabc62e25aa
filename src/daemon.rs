//! Functionality relating to daemon mode applications.
//!
//! A daemon is typically an application that runs as a long lived service
//! in the background, often with restricted access to the host system and
//! able to run initially as a privileged user to, for example, write a
//! pid-file to a privileged location and then switch to running as a
//! non-privileged user once that is done.

use camino::Utf8Path;
use daemonbase::process::Process;

use crate::config::{DaemonConfig, GroupId, UserId};

/// Apply changes to the identity and access rights of the running application
/// in accordance with the provided settings.
pub fn daemonize(config: &DaemonConfig) -> Result<(), String> {
    let mut daemon_config = daemonbase::process::Config::default();

    if let Some((user_id, group_id)) = &config.identity {
        match (user_id, group_id) {
            (UserId::Named(user), GroupId::Named(group)) => {
                daemon_config = daemon_config
                    .with_user(user)
                    .map_err(|err| format!("Invalid user name: {err}"))?
                    .with_group(group)
                    .map_err(|err| format!("Invalid group name: {err}"))?;
            }
            _ => {
                return Err(
                    "Failed to drop privileges: user and group must be names, not IDs".to_string(),
                );
            }
        }
    }

    if let Some(pid_file) = &config.pid_file {
        daemon_config = daemon_config.with_pid_file(into_daemon_path(pid_file.clone()));
    }

    let mut process = Process::from_config(daemon_config);

    if *config.daemonize.value() {
        tracing::debug!("Becoming daemon process");
        if process.setup_daemon(true).is_err() {
            return Err("Failed to become daemon process: unknown error".to_string());
        }
    }

    if let Some((user, group)) = &config.identity {
        tracing::debug!("Dropping privileges to {user} {group}");
        if process.drop_privileges().is_err() {
            return Err("Failed to drop privileges: unknown error".to_string());
        }
    }

    Ok(())
}

fn into_daemon_path(p: Box<Utf8Path>) -> daemonbase::config::ConfigPath {
    let p = p.into_path_buf().into_std_path_buf();
    daemonbase::config::ConfigPath::from(p)
}
