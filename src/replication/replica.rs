//! Replica-side replication: the outbound handshake and the long-lived
//! master-stream consumer.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::ReplicationError;
use crate::command::Command;
use crate::resp::{decode_one, Decoded, Frame};
use crate::store::Store;

pub struct ReplicaClient {
    stream: TcpStream,
    offset: i64,
    first_getack_sent: bool,
}

impl ReplicaClient {
    /// Run the four-step handshake against the master at `host:port`.
    /// Returns the client plus any propagation-stream bytes that arrived
    /// in the same read as the RDB blob.
    pub async fn handshake(host: &str, port: u16, own_port: u16) -> Result<(Self, Vec<u8>), ReplicationError> {
        let mut stream = TcpStream::connect((host, port)).await?;

        expect_simple_reply(&mut stream, Command::Ping.to_frame()).await?;
        expect_simple_reply(
            &mut stream,
            Command::ReplConf(vec![Bytes::from_static(b"listening-port"), Bytes::from(own_port.to_string())]).to_frame(),
        )
        .await?;
        expect_simple_reply(
            &mut stream,
            Command::ReplConf(vec![Bytes::from_static(b"capa"), Bytes::from_static(b"psync2")]).to_frame(),
        )
        .await?;

        stream
            .write_all(
                &Command::Psync {
                    replid: Bytes::from_static(b"?"),
                    offset: Bytes::from_static(b"-1"),
                }
                .to_frame()
                .encode(),
            )
            .await?;

        let mut buf = Vec::with_capacity(4096);
        fill_until_nonempty(&mut stream, &mut buf).await?;

        let fullresync_len = loop {
            match decode_one(&buf).map_err(|_| ReplicationError::UnexpectedHandshakeReply)? {
                Decoded::Frame(_, n) => break n,
                Decoded::NeedMore => fill_until_nonempty(&mut stream, &mut buf).await?,
            }
        };
        buf.drain(..fullresync_len);

        loop {
            if let Some(header_end) = find_crlf(&buf) {
                let len: usize = std::str::from_utf8(&buf[1..header_end])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(ReplicationError::UnexpectedHandshakeReply)?;
                let total = header_end + 2 + len;
                if buf.len() >= total {
                    buf.drain(..total);
                    break;
                }
            }
            fill_until_nonempty(&mut stream, &mut buf).await?;
        }

        Ok((
            Self {
                stream,
                offset: 0,
                first_getack_sent: false,
            },
            buf,
        ))
    }

    /// Consume the master's propagation stream until it closes, applying
    /// writes to `store` and answering `REPLCONF GETACK` on the same socket.
    pub async fn run(mut self, store: Arc<Store>, initial: Vec<u8>) {
        let mut buf = initial;
        let mut chunk = [0u8; 4096];

        loop {
            if buf.is_empty() {
                match self.stream.read(&mut chunk).await {
                    Ok(0) => {
                        info!("master closed the replication stream");
                        return;
                    }
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(err) => {
                        warn!(%err, "replication stream read failed");
                        return;
                    }
                }
            }

            loop {
                match decode_one(&buf) {
                    Ok(Decoded::Frame(frame, consumed)) => {
                        self.apply(frame, consumed, &store).await;
                        buf.drain(..consumed);
                    }
                    Ok(Decoded::NeedMore) => break,
                    Err(err) => {
                        warn!(%err, "malformed frame on replication stream, dropping buffer");
                        buf.clear();
                        break;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, frame: Frame, consumed: usize, store: &Store) {
        match Command::from_frame(&frame) {
            Ok(Command::ReplConf(args)) if is_getack(&args) => {
                let offset_to_report = if self.first_getack_sent { self.offset } else { 0 };
                self.first_getack_sent = true;
                let ack = Command::ReplConf(vec![Bytes::from_static(b"ACK"), Bytes::from(offset_to_report.to_string())]);
                let _ = self.stream.write_all(&ack.to_frame().encode()).await;
            }
            Ok(cmd) => apply_write(&cmd, store),
            Err(_) => {}
        }
        self.offset += consumed as i64;
    }
}

fn is_getack(args: &[Bytes]) -> bool {
    args.first().map(|a| a.eq_ignore_ascii_case(b"GETACK")).unwrap_or(false)
}

fn apply_write(cmd: &Command, store: &Store) {
    match cmd {
        Command::Set { key, value, px } => store.set(key.clone(), value.clone(), *px),
        Command::Del(keys) => {
            store.del(keys);
        }
        Command::Rpush { key, values } => {
            store.rpush(key.clone(), values.clone());
        }
        Command::Lpush { key, values } => {
            store.lpush(key.clone(), values.clone());
        }
        Command::Lpop { key, count } => {
            store.lpop(key, count.unwrap_or(1));
        }
        _ => {}
    }
}

async fn fill_until_nonempty(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<(), ReplicationError> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(ReplicationError::HandshakeClosed);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

async fn expect_simple_reply(stream: &mut TcpStream, frame: Frame) -> Result<(), ReplicationError> {
    stream.write_all(&frame.encode()).await?;
    let mut buf = Vec::with_capacity(64);
    loop {
        fill_until_nonempty(stream, &mut buf).await?;
        match decode_one(&buf) {
            Ok(Decoded::Frame(Frame::Simple(_), _)) => return Ok(()),
            Ok(Decoded::Frame(_, _)) => return Err(ReplicationError::UnexpectedHandshakeReply),
            Ok(Decoded::NeedMore) => continue,
            Err(_) => return Err(ReplicationError::UnexpectedHandshakeReply),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_getack_matches_case_insensitively() {
        assert!(is_getack(&[Bytes::from_static(b"getack"), Bytes::from_static(b"*")]));
        assert!(!is_getack(&[Bytes::from_static(b"ACK"), Bytes::from_static(b"10")]));
    }

    #[test]
    fn apply_write_ignores_read_commands() {
        let store = Store::new();
        apply_write(&Command::Get(b"k".to_vec()), &store);
        assert_eq!(store.get(b"k"), None);
    }

    #[test]
    fn apply_write_sets_and_pushes() {
        let store = Store::new();
        apply_write(
            &Command::Set { key: b"k".to_vec(), value: Bytes::from_static(b"v"), px: None },
            &store,
        );
        assert_eq!(store.get(b"k"), Some(Bytes::from_static(b"v")));
    }
}
