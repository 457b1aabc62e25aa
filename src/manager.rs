//! Spawning and supervising the daemon's units (§10.1): central command,
//! scheduler worker and command server.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::center::{Center, Change};
use crate::units::{central_command, command_server, scheduler_unit};

/// Returned by a unit's `run` loop when it stops, whether asked to or not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Terminated;

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unit terminated")
    }
}

impl std::error::Error for Terminated {}

/// A command sent to a unit's control channel.
pub enum TargetCommand {
    Terminate,
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetCommand::Terminate => f.write_str("Terminate"),
        }
    }
}

/// Handles to the three running units, used to broadcast shutdown.
pub struct Units {
    central_command: mpsc::UnboundedSender<TargetCommand>,
    scheduler: mpsc::UnboundedSender<TargetCommand>,
    command_server: mpsc::UnboundedSender<TargetCommand>,
}

impl Units {
    /// Ask every unit to stop. Their `run` loops exit on their own schedule;
    /// this does not wait for them.
    pub fn shut_down(&self) {
        let _ = self.central_command.send(TargetCommand::Terminate);
        let _ = self.scheduler.send(TargetCommand::Terminate);
        let _ = self.command_server.send(TargetCommand::Terminate);
    }
}

/// Spawn the three units and return handles to command them.
pub fn spawn(center: Arc<Center>, change_rx: mpsc::UnboundedReceiver<Change>) -> Units {
    tracing::info!("starting unit 'central-command'");
    let (cc_tx, cc_rx) = mpsc::unbounded_channel();
    tokio::spawn(central_command::run(center.clone(), cc_rx, change_rx));

    tracing::info!("starting unit 'scheduler'");
    let (sched_tx, sched_rx) = mpsc::unbounded_channel();
    tokio::spawn(scheduler_unit::run(center.clone(), sched_rx));

    tracing::info!("starting unit 'command-server'");
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(command_server::run(center, cmd_rx));

    Units {
        central_command: cc_tx,
        scheduler: sched_tx,
        command_server: cmd_tx,
    }
}
