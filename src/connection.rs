//! Per-connection session (C5): read frames off the socket, dispatch through
//! the command engine, write replies. A `PSYNC` hands the socket off to the
//! replication master as a replica session and ends the generic loop.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::command::{Command, CommandError};
use crate::replication::EMPTY_RDB;
use crate::resp::{decode_one, encode_rdb_blob, Decoded, Frame};
use crate::state::{AppState, Role};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
}

pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }

    pub async fn handle(mut self, state: Arc<AppState>) -> Result<(), ConnectionError> {
        info!(addr = %self.addr, "accepted new connection");
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        let mut promoted = false;

        'outer: loop {
            if buf.is_empty() {
                let n = self.stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            loop {
                match decode_one(&buf) {
                    Ok(Decoded::Frame(frame, consumed)) => {
                        buf.drain(..consumed);
                        match self.dispatch(frame, &state).await {
                            Ok(true) => {
                                promoted = true;
                                break 'outer;
                            }
                            Ok(false) => {}
                            Err(err) => {
                                warn!(addr = %self.addr, %err, "connection error");
                                break 'outer;
                            }
                        }
                    }
                    Ok(Decoded::NeedMore) => break,
                    Err(err) => {
                        warn!(addr = %self.addr, %err, "protocol error, closing connection");
                        break 'outer;
                    }
                }
            }
        }

        if promoted {
            if let Role::Master(master) = &state.role {
                info!(addr = %self.addr, "connection promoted to replica");
                master.add_replica(self.stream, self.addr).await;
            }
        }

        Ok(())
    }

    /// Dispatch one decoded frame. Returns `Ok(true)` if this connection was
    /// just promoted to a replica session via `PSYNC`.
    async fn dispatch(&mut self, frame: Frame, state: &Arc<AppState>) -> Result<bool, ConnectionError> {
        let command = match Command::from_frame(&frame) {
            Ok(command) => command,
            Err(err) => {
                self.stream.write_all(&wire_error(&err).encode()).await?;
                return Ok(false);
            }
        };

        if let Command::Psync { .. } = &command {
            return self.handle_psync(state).await;
        }

        let (reply, mutated) = execute(&command, state).await;
        self.stream.write_all(&reply.encode()).await?;

        if mutated && command.is_write() {
            if let Role::Master(master) = &state.role {
                let propagated = propagation_frame(&command).encode();
                master.propagate(&propagated).await;
            }
        }

        Ok(false)
    }

    async fn handle_psync(&mut self, state: &Arc<AppState>) -> Result<bool, ConnectionError> {
        let Role::Master(master) = &state.role else {
            self.stream
                .write_all(&Frame::error("ERR PSYNC not supported in this role").encode())
                .await?;
            return Ok(false);
        };

        let fullresync = Frame::simple(format!("FULLRESYNC {} 0", master.replid));
        self.stream.write_all(&fullresync.encode()).await?;
        self.stream.write_all(&encode_rdb_blob(EMPTY_RDB)).await?;
        Ok(true)
    }
}

/// Re-encode a command into the frame actually propagated to replicas.
/// Identical to `Command::to_frame` except `BLPOP`, which a replica must
/// never receive verbatim since it must not itself block.
fn propagation_frame(command: &Command) -> Frame {
    match command {
        Command::Blpop { key, .. } => Command::Lpop { key: key.clone(), count: Some(1) }.to_frame(),
        other => other.to_frame(),
    }
}

fn wire_error(err: &CommandError) -> Frame {
    let message = match err {
        CommandError::WrongArity(name) => format!("ERR wrong number of arguments for {} command", name),
        CommandError::NotAnInteger => "ERR value is not an integer or out of range".to_string(),
        CommandError::Unknown(name) => format!("ERR unknown command '{}'", name),
    };
    Frame::error(message)
}

/// Execute a parsed command against shared state and produce its reply plus
/// whether the store was actually mutated. Most write commands always
/// mutate when they run at all; `LPOP`/`BLPOP` only propagate to replicas
/// when they actually removed an element, so their mutation flag is
/// computed from the result rather than the command shape.
///
/// `PSYNC` is excluded — it is handled by `Connection::handle_psync` since
/// it needs to take ownership of the socket on success.
async fn execute(command: &Command, state: &Arc<AppState>) -> (Frame, bool) {
    match command {
        Command::Ping => (Frame::simple("PONG"), false),
        Command::Echo(msg) => (Frame::Bulk(msg.clone()), false),
        Command::Set { key, value, px } => {
            state.store.set(key.clone(), value.clone(), *px);
            (Frame::simple("OK"), true)
        }
        Command::Get(key) => match state.store.get(key) {
            Some(value) => (Frame::Bulk(value), false),
            None => (Frame::NullBulk, false),
        },
        Command::Del(keys) => (Frame::Integer(state.store.del(keys) as i64), true),
        Command::Keys(pattern) => (Frame::array_of_bulks(state.store.keys(pattern)), false),
        Command::ConfigGet(name) => {
            let value = if name.eq_ignore_ascii_case(b"dir") {
                Some(state.config.dir.clone())
            } else if name.eq_ignore_ascii_case(b"dbfilename") {
                Some(state.config.dbfilename.clone())
            } else {
                None
            };
            let frame = match value {
                Some(value) => Frame::array_of_bulks([name.clone(), value.into_bytes()]),
                None => Frame::Array(vec![]),
            };
            (frame, false)
        }
        Command::Info(_section) => (Frame::Bulk(info_reply(state).await.into()), false),
        // GETACK only ever arrives on a replica's own master-stream consumer
        // (handled in `replication::replica`), never on an ordinary client
        // connection, so this arm only has to answer the handshake REPLCONFs.
        Command::ReplConf(_) => (Frame::simple("OK"), false),
        Command::Psync { .. } => unreachable!("handled by Connection::handle_psync"),
        Command::Wait { num_replicas, timeout_ms } => {
            let count = match &state.role {
                Role::Master(master) => master.wait(*num_replicas, *timeout_ms).await,
                Role::Replica => 0,
            };
            (Frame::Integer(count), false)
        }
        Command::Rpush { key, values } => (Frame::Integer(state.store.rpush(key.clone(), values.clone()) as i64), true),
        Command::Lpush { key, values } => (Frame::Integer(state.store.lpush(key.clone(), values.clone()) as i64), true),
        Command::Lrange { key, start, stop } => (Frame::array_of_bulks(state.store.lrange(key, *start, *stop)), false),
        Command::Llen(key) => (Frame::Integer(state.store.llen(key) as i64), false),
        Command::Lpop { key, count } => {
            let popped = state.store.lpop(key, count.unwrap_or(1));
            let mutated = matches!(&popped, Some(values) if !values.is_empty());
            let frame = match (popped, count) {
                (Some(values), Some(_)) => Frame::array_of_bulks(values),
                (Some(values), None) => values.into_iter().next().map(Frame::Bulk).unwrap_or(Frame::NullBulk),
                (None, Some(_)) => Frame::NullArray,
                (None, None) => Frame::NullBulk,
            };
            (frame, mutated)
        }
        Command::Blpop { key, timeout_secs } => match state.store.blpop(key, *timeout_secs).await {
            Some((key, value)) => (Frame::array_of_bulks([key, value.to_vec()]), true),
            None => (Frame::NullArray, false),
        },
    }
}

async fn info_reply(state: &Arc<AppState>) -> String {
    let (role, connected_slaves) = match &state.role {
        Role::Master(master) => ("master", master.replica_count().await),
        Role::Replica => ("slave", 0),
    };
    format!(
        "role:{}\r\nconnected_slaves:{}\r\nmaster_replid:{}\r\nmaster_repl_offset:0\r\n",
        role, connected_slaves, state.replid,
    )
}
