//! The framed wire protocol spoken over the daemon's Unix command socket.
//!
//! One connection carries exactly one command: the client sends a single
//! [`Opcode::Stdin`] frame, the daemon replies with zero or more
//! [`Opcode::Stdout`]/[`Opcode::Stderr`] frames, then an [`Opcode::Exit`]
//! frame carrying a one-byte status code.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Stdin,
    Stdout,
    Stderr,
    Exit,
}

impl Opcode {
    fn to_byte(self) -> u8 {
        match self {
            Opcode::Stdin => 0x00,
            Opcode::Stdout => 0x01,
            Opcode::Stderr => 0x02,
            Opcode::Exit => 0x03,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Opcode::Stdin),
            0x01 => Some(Opcode::Stdout),
            0x02 => Some(Opcode::Stderr),
            0x03 => Some(Opcode::Exit),
            _ => None,
        }
    }
}

pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read one frame: 1-byte opcode, 2-byte big-endian length, payload.
///
/// Returns `Ok(None)` on a clean EOF before any bytes of a new frame arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Frame>> {
    let mut header = [0u8; 3];
    if let Err(err) = r.read_exact(&mut header).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let Some(opcode) = Opcode::from_byte(header[0]) else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown opcode"));
    };
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame { opcode, payload }))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, opcode: Opcode, payload: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    let mut header = [opcode.to_byte(), 0, 0];
    header[1..].copy_from_slice(&len.to_be_bytes());
    w.write_all(&header).await?;
    w.write_all(&payload[..len as usize]).await?;
    Ok(())
}

pub async fn write_exit<W: AsyncWrite + Unpin>(w: &mut W, status: u8) -> std::io::Result<()> {
    write_frame(w, Opcode::Exit, &[status]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_frame_round_trips_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, Opcode::Stdin, b"zone add --name example. --policy default").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Stdin);
        assert_eq!(frame.payload, b"zone add --name example. --policy default");
    }

    #[tokio::test]
    async fn eof_before_a_frame_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }
}
