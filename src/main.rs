use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use enforcerd::center::{self, Center, StateSpec};
use enforcerd::config::Config;
use enforcerd::daemon::daemonize;
use enforcerd::log::Logger;
use enforcerd::{manager, policy};
use clap::{crate_authors, crate_version};
use tokio::sync::mpsc;

fn main() -> ExitCode {
    let cmd = clap::Command::new("enforcerd")
        .version(crate_version!())
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .default_value("/etc/enforcerd/config.toml")
                .help("Path to the daemon configuration file"),
        )
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let matches = cmd.get_matches();
    let config_path = Utf8PathBuf::from(matches.get_one::<String>("config").unwrap().as_str());

    // Fall back to stderr logging until the real configuration is loaded.
    let logger = match Logger::launch(&Default::default()) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("enforcerd couldn't start logging: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::default();
    if let Err(err) = config.init_from_file(&config_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::error!("couldn't read configuration from '{config_path}': {err}");
            return ExitCode::FAILURE;
        }
        tracing::warn!("no configuration file at '{config_path}'; using defaults");
    }

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    if let Err(err) = logger.apply(&config.daemon.logging) {
        eprintln!("enforcerd couldn't apply logging configuration: {err}");
        return ExitCode::FAILURE;
    }

    let mut policies = foldhash::HashMap::default();
    if let Err(err) = policy::reload_all(&mut policies, &config, |_| {}) {
        tracing::error!("couldn't load policies from '{}': {err}", config.policy_dir);
        return ExitCode::FAILURE;
    }
    tracing::info!("loaded {} {}", policies.len(), if policies.len() == 1 { "policy" } else { "policies" });

    let state_file = config.state_file.clone();

    if let Err(err) = daemonize(&config.daemon) {
        tracing::error!("failed to daemonize: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("enforcerd couldn't start its async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let center = Arc::new(Center::new(config, logger, change_tx));
        *center.policies.lock().unwrap() = policies;

        match StateSpec::load(&state_file) {
            Ok(spec) => {
                spec.restore_into(&center);
                tracing::info!("restored {} zone(s) from '{state_file}'", spec.zones.len());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no state file at '{state_file}'; starting from scratch");
            }
            Err(err) => {
                tracing::error!("failed to load state from '{state_file}': {err}");
                return ExitCode::FAILURE;
            }
        }

        let units = manager::spawn(center.clone(), change_rx);

        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!("failed to install SIGHUP handler: {err}");
                return ExitCode::FAILURE;
            }
        };

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        tracing::error!("listening for CTRL-C failed: {err}");
                    }
                    break;
                }
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, reloading policies");
                    if let Err(err) = center::reload_policies(&center) {
                        tracing::error!("policy reload failed: {err}");
                    }
                }
            }
        }

        units.shut_down();
        if let Ok(spec) = StateSpec::build(&center) {
            if let Err(err) = spec.save(&center.config.state_file) {
                tracing::warn!("failed to persist state on shutdown: {err}");
            }
        }

        ExitCode::SUCCESS
    })
}
