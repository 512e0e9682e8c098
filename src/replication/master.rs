//! Master-side replication: replica bookkeeping, write fan-out, and the
//! `WAIT` acknowledgement barrier.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::command::Command;
use crate::resp::{decode_one, Decoded};

struct ReplicaSession {
    addr: SocketAddr,
    stream: TcpStream,
    inbound: Vec<u8>,
}

/// Replication state held by a master: the live replica set, the write
/// sequence counter, and the pending-ack bookkeeping `WAIT` consults.
pub struct Master {
    pub replid: String,
    replicas: Mutex<Vec<ReplicaSession>>,
    write_sequence: AtomicU64,
    pending_acks: Mutex<HashMap<u64, HashSet<SocketAddr>>>,
}

impl Master {
    pub fn new(replid: String) -> Self {
        Self {
            replid,
            replicas: Mutex::new(Vec::new()),
            write_sequence: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a freshly full-resynced socket as a replica session.
    pub async fn add_replica(&self, stream: TcpStream, addr: SocketAddr) {
        self.replicas.lock().await.push(ReplicaSession {
            addr,
            stream,
            inbound: Vec::new(),
        });
    }

    pub async fn replica_count(&self) -> usize {
        self.replicas.lock().await.len()
    }

    /// Fan out the canonical encoded form of a write command to every
    /// connected replica, dropping any that fail to accept it.
    pub async fn propagate(&self, frame_bytes: &[u8]) {
        let seq = self.write_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut replicas = self.replicas.lock().await;
        let current: HashSet<SocketAddr> = replicas.iter().map(|r| r.addr).collect();
        if !current.is_empty() {
            self.pending_acks.lock().await.insert(seq, current);
        }

        let mut failed = Vec::new();
        for (i, replica) in replicas.iter_mut().enumerate() {
            if replica.stream.write_all(frame_bytes).await.is_err() {
                failed.push(i);
            }
        }
        for i in failed.into_iter().rev() {
            let dead = replicas.remove(i);
            warn!(addr = %dead.addr, "replica write failed, dropping");
            let mut pending = self.pending_acks.lock().await;
            self.purge_locked(&mut pending, dead.addr);
        }
    }

    /// Runs the `WAIT n timeout_ms` barrier algorithm.
    pub async fn wait(&self, num_replicas: i64, timeout_ms: i64) -> i64 {
        let target = self.write_sequence.load(Ordering::SeqCst);
        if target == 0 {
            return self.replica_count().await as i64;
        }

        let getack = Command::ReplConf(vec![
            bytes::Bytes::from_static(b"GETACK"),
            bytes::Bytes::from_static(b"*"),
        ])
        .to_frame()
        .encode();
        {
            let mut replicas = self.replicas.lock().await;
            for replica in replicas.iter_mut() {
                let _ = replica.stream.write_all(&getack).await;
            }
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64);
        loop {
            self.poll_acks(target).await;
            let acked = self.acked_count(target).await;
            if acked as i64 >= num_replicas || Instant::now() >= deadline {
                return acked as i64;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(Duration::from_millis(5))).await;
        }
    }

    /// Non-blocking read attempt on every replica socket, parsing any
    /// complete `REPLCONF ACK <offset>` frames found.
    async fn poll_acks(&self, target: u64) {
        let mut replicas = self.replicas.lock().await;
        let mut buf = [0u8; 1024];
        let mut dead = Vec::new();
        let mut acked_addrs = Vec::new();

        for (i, replica) in replicas.iter_mut().enumerate() {
            match tokio::time::timeout(Duration::from_millis(2), replica.stream.read(&mut buf)).await {
                Ok(Ok(0)) => dead.push(i),
                Ok(Ok(n)) => {
                    replica.inbound.extend_from_slice(&buf[..n]);
                    if drain_acks(&mut replica.inbound) {
                        acked_addrs.push(replica.addr);
                    }
                }
                Ok(Err(_)) => dead.push(i),
                Err(_elapsed) => {}
            }
        }

        let mut dead_addrs = Vec::new();
        for i in dead.into_iter().rev() {
            let removed = replicas.remove(i);
            acked_addrs.retain(|a| *a != removed.addr);
            dead_addrs.push(removed.addr);
        }
        drop(replicas);

        if !acked_addrs.is_empty() || !dead_addrs.is_empty() {
            let mut pending = self.pending_acks.lock().await;
            for addr in acked_addrs {
                self.ack_locked(&mut pending, addr, target);
            }
            for addr in dead_addrs {
                self.purge_locked(&mut pending, addr);
            }
        }
    }

    fn ack_locked(&self, pending: &mut HashMap<u64, HashSet<SocketAddr>>, addr: SocketAddr, up_to: u64) {
        let mut drained = Vec::new();
        for (seq, waiting) in pending.iter_mut() {
            if *seq <= up_to {
                waiting.remove(&addr);
                if waiting.is_empty() {
                    drained.push(*seq);
                }
            }
        }
        for seq in drained {
            pending.remove(&seq);
        }
    }

    fn purge_locked(&self, pending: &mut HashMap<u64, HashSet<SocketAddr>>, addr: SocketAddr) {
        pending.retain(|_, waiting| {
            waiting.remove(&addr);
            !waiting.is_empty()
        });
    }

    async fn acked_count(&self, target: u64) -> usize {
        let total = self.replica_count().await;
        let still_pending = self
            .pending_acks
            .lock()
            .await
            .get(&target)
            .map(HashSet::len)
            .unwrap_or(0);
        total.saturating_sub(still_pending)
    }
}

/// Parse as many `REPLCONF ACK <offset>` frames as possible out of `inbound`,
/// discarding them (and anything else decodable) as consumed. Returns
/// whether at least one ACK was found.
fn drain_acks(inbound: &mut Vec<u8>) -> bool {
    let mut saw_ack = false;
    let mut consumed_total = 0;
    loop {
        match decode_one(&inbound[consumed_total..]) {
            Ok(Decoded::Frame(frame, consumed)) => {
                if let Ok(Command::ReplConf(args)) = Command::from_frame(&frame) {
                    if args.first().map(|a| a.eq_ignore_ascii_case(b"ACK")).unwrap_or(false) {
                        saw_ack = true;
                    }
                }
                consumed_total += consumed;
            }
            _ => break,
        }
    }
    inbound.drain(..consumed_total);
    saw_ack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_with_no_writes_returns_replica_count_immediately() {
        let master = Master::new("a".repeat(40));
        assert_eq!(master.wait(0, 100).await, 0);
    }

    #[tokio::test]
    async fn drain_acks_recognizes_replconf_ack() {
        let mut buf = Command::ReplConf(vec![bytes::Bytes::from_static(b"ACK"), bytes::Bytes::from_static(b"10")])
            .to_frame()
            .encode();
        assert!(drain_acks(&mut buf));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn propagate_without_replicas_still_advances_sequence() {
        let master = Master::new("a".repeat(40));
        master.propagate(b"noop").await;
        assert_eq!(master.write_sequence.load(Ordering::SeqCst), 1);
    }
}
