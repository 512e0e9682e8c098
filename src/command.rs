//! Command decoding and the dispatch table shape.

use crate::resp::Frame;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("unknown command '{0}'")]
    Unknown(String),
}

/// A fully parsed command, ready for dispatch against a `Store`/`Master`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Bytes),
    Set { key: Vec<u8>, value: Bytes, px: Option<i64> },
    Get(Vec<u8>),
    Del(Vec<Vec<u8>>),
    Keys(Vec<u8>),
    ConfigGet(Vec<u8>),
    Info(Option<Vec<u8>>),
    ReplConf(Vec<Bytes>),
    Psync { replid: Bytes, offset: Bytes },
    Wait { num_replicas: i64, timeout_ms: i64 },
    Rpush { key: Vec<u8>, values: Vec<Bytes> },
    Lpush { key: Vec<u8>, values: Vec<Bytes> },
    Lrange { key: Vec<u8>, start: i64, stop: i64 },
    Llen(Vec<u8>),
    Lpop { key: Vec<u8>, count: Option<usize> },
    Blpop { key: Vec<u8>, timeout_secs: f64 },
}

impl Command {
    /// Commands that mutate the store and must be propagated to replicas
    /// after a successful dispatch on a master.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Del(_)
                | Command::Rpush { .. }
                | Command::Lpush { .. }
                | Command::Lpop { .. }
                | Command::Blpop { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Echo(_) => "ECHO",
            Command::Set { .. } => "SET",
            Command::Get(_) => "GET",
            Command::Del(_) => "DEL",
            Command::Keys(_) => "KEYS",
            Command::ConfigGet(_) => "CONFIG",
            Command::Info(_) => "INFO",
            Command::ReplConf(_) => "REPLCONF",
            Command::Psync { .. } => "PSYNC",
            Command::Wait { .. } => "WAIT",
            Command::Rpush { .. } => "RPUSH",
            Command::Lpush { .. } => "LPUSH",
            Command::Lrange { .. } => "LRANGE",
            Command::Llen(_) => "LLEN",
            Command::Lpop { .. } => "LPOP",
            Command::Blpop { .. } => "BLPOP",
        }
    }

    /// Parse a decoded array-of-bulks frame into a `Command`.
    pub fn from_frame(frame: &Frame) -> Result<Self, CommandError> {
        let Frame::Array(items) = frame else {
            return Err(CommandError::Unknown(String::from("<malformed>")));
        };
        let args: Vec<&Bytes> = items
            .iter()
            .filter_map(Frame::as_bulk)
            .collect();
        if args.is_empty() {
            return Err(CommandError::Unknown(String::new()));
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let rest = &args[1..];

        match name.as_str() {
            "PING" => Ok(Command::Ping),
            "ECHO" => {
                expect_arity(&name, rest, 1)?;
                Ok(Command::Echo(rest[0].clone()))
            }
            "SET" => {
                if rest.len() < 2 {
                    return Err(CommandError::WrongArity(name));
                }
                let mut px = None;
                if rest.len() >= 4 && rest[2].eq_ignore_ascii_case(b"PX") {
                    let ms: i64 = parse_int(&rest[3])?;
                    px = Some(crate::store::now_ms() + ms);
                }
                Ok(Command::Set {
                    key: rest[0].to_vec(),
                    value: rest[1].clone(),
                    px,
                })
            }
            "GET" => {
                expect_arity(&name, rest, 1)?;
                Ok(Command::Get(rest[0].to_vec()))
            }
            "DEL" => {
                if rest.is_empty() {
                    return Err(CommandError::WrongArity(name));
                }
                Ok(Command::Del(rest.iter().map(|b| b.to_vec()).collect()))
            }
            "KEYS" => {
                expect_arity(&name, rest, 1)?;
                Ok(Command::Keys(rest[0].to_vec()))
            }
            "CONFIG" => {
                if rest.len() < 2 || !rest[0].eq_ignore_ascii_case(b"GET") {
                    return Err(CommandError::WrongArity(name));
                }
                Ok(Command::ConfigGet(rest[1].to_vec()))
            }
            "INFO" => Ok(Command::Info(rest.first().map(|b| b.to_vec()))),
            "REPLCONF" => Ok(Command::ReplConf(rest.iter().map(|b| (*b).clone()).collect())),
            "PSYNC" => {
                expect_arity(&name, rest, 2)?;
                Ok(Command::Psync {
                    replid: rest[0].clone(),
                    offset: rest[1].clone(),
                })
            }
            "WAIT" => {
                expect_arity(&name, rest, 2)?;
                Ok(Command::Wait {
                    num_replicas: parse_int(&rest[0])?,
                    timeout_ms: parse_int(&rest[1])?,
                })
            }
            "RPUSH" => {
                if rest.len() < 2 {
                    return Err(CommandError::WrongArity(name));
                }
                Ok(Command::Rpush {
                    key: rest[0].to_vec(),
                    values: rest[1..].iter().map(|b| (*b).clone()).collect(),
                })
            }
            "LPUSH" => {
                if rest.len() < 2 {
                    return Err(CommandError::WrongArity(name));
                }
                Ok(Command::Lpush {
                    key: rest[0].to_vec(),
                    values: rest[1..].iter().map(|b| (*b).clone()).collect(),
                })
            }
            "LRANGE" => {
                expect_arity(&name, rest, 3)?;
                Ok(Command::Lrange {
                    key: rest[0].to_vec(),
                    start: parse_int(&rest[1])?,
                    stop: parse_int(&rest[2])?,
                })
            }
            "LLEN" => {
                expect_arity(&name, rest, 1)?;
                Ok(Command::Llen(rest[0].to_vec()))
            }
            "LPOP" => {
                if rest.is_empty() {
                    return Err(CommandError::WrongArity(name));
                }
                let count = if rest.len() >= 2 {
                    Some(parse_int(&rest[1])?.max(0) as usize)
                } else {
                    None
                };
                Ok(Command::Lpop { key: rest[0].to_vec(), count })
            }
            "BLPOP" => {
                expect_arity(&name, rest, 2)?;
                let timeout_secs = std::str::from_utf8(&rest[1])
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or(CommandError::NotAnInteger)?;
                Ok(Command::Blpop { key: rest[0].to_vec(), timeout_secs })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Re-encode this command as the canonical array-of-bulks frame, the
    /// form propagated verbatim to replicas (except `BLPOP`, see
    /// `propagation_frame`).
    pub fn to_frame(&self) -> Frame {
        match self {
            Command::Ping => Frame::array_of_bulks(["PING"]),
            Command::Echo(msg) => Frame::Array(vec![Frame::bulk("ECHO"), Frame::Bulk(msg.clone())]),
            Command::Set { key, value, px } => {
                let mut items = vec![
                    Frame::bulk("SET"),
                    Frame::Bulk(Bytes::copy_from_slice(key)),
                    Frame::Bulk(value.clone()),
                ];
                if let Some(expiry_at) = px {
                    items.push(Frame::bulk("PX"));
                    items.push(Frame::bulk((expiry_at - crate::store::now_ms()).to_string()));
                }
                Frame::Array(items)
            }
            Command::Get(key) => Frame::Array(vec![Frame::bulk("GET"), Frame::Bulk(Bytes::copy_from_slice(key))]),
            Command::Del(keys) => {
                let mut items = vec![Frame::bulk("DEL")];
                items.extend(keys.iter().map(|k| Frame::Bulk(Bytes::copy_from_slice(k))));
                Frame::Array(items)
            }
            Command::Keys(pattern) => Frame::Array(vec![Frame::bulk("KEYS"), Frame::Bulk(Bytes::copy_from_slice(pattern))]),
            Command::ConfigGet(name) => {
                Frame::Array(vec![Frame::bulk("CONFIG"), Frame::bulk("GET"), Frame::Bulk(Bytes::copy_from_slice(name))])
            }
            Command::Info(section) => {
                let mut items = vec![Frame::bulk("INFO")];
                if let Some(s) = section {
                    items.push(Frame::Bulk(Bytes::copy_from_slice(s)));
                }
                Frame::Array(items)
            }
            Command::ReplConf(args) => {
                let mut items = vec![Frame::bulk("REPLCONF")];
                items.extend(args.iter().cloned().map(Frame::Bulk));
                Frame::Array(items)
            }
            Command::Psync { replid, offset } => {
                Frame::Array(vec![Frame::bulk("PSYNC"), Frame::Bulk(replid.clone()), Frame::Bulk(offset.clone())])
            }
            Command::Wait { num_replicas, timeout_ms } => Frame::Array(vec![
                Frame::bulk("WAIT"),
                Frame::bulk(num_replicas.to_string()),
                Frame::bulk(timeout_ms.to_string()),
            ]),
            Command::Rpush { key, values } => {
                let mut items = vec![Frame::bulk("RPUSH"), Frame::Bulk(Bytes::copy_from_slice(key))];
                items.extend(values.iter().cloned().map(Frame::Bulk));
                Frame::Array(items)
            }
            Command::Lpush { key, values } => {
                let mut items = vec![Frame::bulk("LPUSH"), Frame::Bulk(Bytes::copy_from_slice(key))];
                items.extend(values.iter().cloned().map(Frame::Bulk));
                Frame::Array(items)
            }
            Command::Lrange { key, start, stop } => Frame::Array(vec![
                Frame::bulk("LRANGE"),
                Frame::Bulk(Bytes::copy_from_slice(key)),
                Frame::bulk(start.to_string()),
                Frame::bulk(stop.to_string()),
            ]),
            Command::Llen(key) => Frame::Array(vec![Frame::bulk("LLEN"), Frame::Bulk(Bytes::copy_from_slice(key))]),
            Command::Lpop { key, count } => {
                let mut items = vec![Frame::bulk("LPOP"), Frame::Bulk(Bytes::copy_from_slice(key))];
                if let Some(n) = count {
                    items.push(Frame::bulk(n.to_string()));
                }
                Frame::Array(items)
            }
            Command::Blpop { key, timeout_secs } => Frame::Array(vec![
                Frame::bulk("BLPOP"),
                Frame::Bulk(Bytes::copy_from_slice(key)),
                Frame::bulk(timeout_secs.to_string()),
            ]),
        }
    }
}

fn expect_arity(name: &str, rest: &[&Bytes], expected: usize) -> Result<(), CommandError> {
    if rest.len() != expected {
        Err(CommandError::WrongArity(name.to_string()))
    } else {
        Ok(())
    }
}

fn parse_int(bytes: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotAnInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(args: &[&str]) -> Frame {
        Frame::array_of_bulks(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_ping_and_echo() {
        assert_eq!(Command::from_frame(&frame_of(&["PING"])).unwrap(), Command::Ping);
        assert_eq!(
            Command::from_frame(&frame_of(&["echo", "hello"])).unwrap(),
            Command::Echo(Bytes::from("hello"))
        );
    }

    #[test]
    fn set_with_px_computes_absolute_expiry() {
        let before = crate::store::now_ms();
        let cmd = Command::from_frame(&frame_of(&["SET", "k", "v", "PX", "100"])).unwrap();
        match cmd {
            Command::Set { px: Some(exp), .. } => assert!(exp >= before + 100),
            _ => panic!("expected SET with PX"),
        }
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert_eq!(
            Command::from_frame(&frame_of(&["GET"])).unwrap_err(),
            CommandError::WrongArity("GET".to_string())
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(
            Command::from_frame(&frame_of(&["FROBNICATE"])).unwrap_err(),
            CommandError::Unknown("FROBNICATE".to_string())
        );
    }

    #[test]
    fn bad_integer_argument_is_rejected() {
        assert_eq!(
            Command::from_frame(&frame_of(&["LLEN", "k", "extra"])).unwrap_err(),
            CommandError::WrongArity("LLEN".to_string())
        );
        assert_eq!(
            Command::from_frame(&frame_of(&["WAIT", "abc", "100"])).unwrap_err(),
            CommandError::NotAnInteger
        );
    }

    #[test]
    fn rpush_and_lpush_collect_all_values() {
        let cmd = Command::from_frame(&frame_of(&["RPUSH", "l", "a", "b", "c"])).unwrap();
        match cmd {
            Command::Rpush { key, values } => {
                assert_eq!(key, b"l");
                assert_eq!(values.len(), 3);
            }
            _ => panic!("expected RPUSH"),
        }
    }

    #[test]
    fn is_write_classifies_correctly() {
        assert!(Command::from_frame(&frame_of(&["SET", "k", "v"])).unwrap().is_write());
        assert!(!Command::from_frame(&frame_of(&["GET", "k"])).unwrap().is_write());
        assert!(Command::from_frame(&frame_of(&["BLPOP", "k", "0"])).unwrap().is_write());
    }
}
