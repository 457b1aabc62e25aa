use std::process::ExitCode;

use clap::Parser;
use enforcerd_api::{read_frame, write_frame, Opcode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::error;

mod args;

use args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .init();

    match run(args).await {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<u8, String> {
    let line = args.command.join(" ");

    let mut stream = UnixStream::connect(args.socket.as_std_path())
        .await
        .map_err(|err| format!("couldn't connect to '{}': {err}", args.socket))?;

    write_frame(&mut stream, Opcode::Stdin, line.as_bytes())
        .await
        .map_err(|err| format!("couldn't send command: {err}"))?;
    stream
        .shutdown()
        .await
        .map_err(|err| format!("couldn't close write half: {err}"))?;

    let mut stream = BufReader::new(stream);
    loop {
        let frame = read_frame(&mut stream)
            .await
            .map_err(|err| format!("couldn't read response: {err}"))?;
        let Some(frame) = frame else {
            return Err("the daemon closed the connection without an exit status".to_string());
        };
        match frame.opcode {
            Opcode::Stdout => print!("{}", String::from_utf8_lossy(&frame.payload)),
            Opcode::Stderr => eprint!("{}", String::from_utf8_lossy(&frame.payload)),
            Opcode::Exit => return Ok(frame.payload.first().copied().unwrap_or(1)),
            Opcode::Stdin => return Err("unexpected Stdin frame from the daemon".to_string()),
        }
    }
}
