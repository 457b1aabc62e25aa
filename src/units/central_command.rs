//! Reacts to [`Change`] events broadcast by [`crate::center`]: logs them and
//! keeps the on-disk recovery snapshot current.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::center::{Center, Change, StateSpec};
use crate::manager::TargetCommand;

pub async fn run(
    center: Arc<Center>,
    mut cmd_rx: mpsc::UnboundedReceiver<TargetCommand>,
    mut change_rx: mpsc::UnboundedReceiver<Change>,
) {
    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(TargetCommand::Terminate) => {
                        tracing::info!("central command shutting down");
                        return;
                    }
                }
            }

            change = change_rx.recv() => {
                match change {
                    Some(change) => direct_change(&center, &change),
                    None => return,
                }
            }
        }
    }
}

fn direct_change(center: &Center, change: &Change) {
    match change {
        Change::ConfigChanged => tracing::info!("configuration reloaded"),
        Change::PolicyAdded(policy) => tracing::info!("policy '{}' added", policy.name),
        Change::PolicyChanged(_, new) => tracing::info!("policy '{}' changed", new.name),
        Change::PolicyRemoved(policy) => tracing::info!("policy '{}' removed", policy.name),
        Change::ZoneAdded(id) => {
            tracing::info!("zone {id} added");
            persist_state(center);
        }
        Change::ZoneRemoved(id) => {
            tracing::info!("zone {id} removed");
            persist_state(center);
        }
    }
}

fn persist_state(center: &Center) {
    let spec = match StateSpec::build(center) {
        Ok(spec) => spec,
        Err(err) => {
            tracing::warn!("failed to snapshot state: {err}");
            return;
        }
    };
    if let Err(err) = spec.save(&center.config.state_file) {
        tracing::warn!("failed to persist state to '{}': {err}", center.config.state_file);
    }
}
