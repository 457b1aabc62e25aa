//! The Unix-domain command socket listener (§6/§10.1): one connection per
//! command, framed per [`crate::comms`].

use std::io;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::center::Center;
use crate::comms::{self, Opcode};
use crate::manager::TargetCommand;

pub async fn run(center: Arc<Center>, mut cmd_rx: mpsc::UnboundedReceiver<TargetCommand>) {
    let path = center.config.command_socket.clone();
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::error!("failed to create '{parent}': {err}");
            return;
        }
    }
    let _ = std::fs::remove_file(&path);

    let listener = match UnixListener::bind(path.as_std_path()) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("failed to bind command socket '{path}': {err}");
            return;
        }
    };
    tracing::info!("listening for commands on '{path}'");

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                if matches!(cmd, None | Some(TargetCommand::Terminate)) {
                    tracing::info!("command server shutting down");
                    let _ = std::fs::remove_file(&path);
                    return;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let center = center.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(&center, stream).await {
                                tracing::warn!("command connection error: {err}");
                            }
                        });
                    }
                    Err(err) => tracing::warn!("failed to accept command connection: {err}"),
                }
            }
        }
    }
}

async fn handle_connection(center: &Center, mut stream: UnixStream) -> io::Result<()> {
    let Some(frame) = comms::read_frame(&mut stream).await? else {
        return Ok(());
    };
    if frame.opcode != Opcode::Stdin {
        return comms::write_exit(&mut stream, 2).await;
    }
    let line = String::from_utf8_lossy(&frame.payload).into_owned();

    let outcome = comms::dispatch(center, &line);

    if !outcome.stdout.is_empty() {
        comms::write_frame(&mut stream, Opcode::Stdout, outcome.stdout.as_bytes()).await?;
    }
    if !outcome.stderr.is_empty() {
        comms::write_frame(&mut stream, Opcode::Stderr, outcome.stderr.as_bytes()).await?;
    }
    comms::write_exit(&mut stream, outcome.status).await
}
