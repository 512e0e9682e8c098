//! The in-memory key-value store: string and list entries with lazy expiry
//! and a blocking list pop.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Entry {
    String { bytes: Bytes, expiry: Option<i64> },
    List { items: VecDeque<Bytes>, expiry: Option<i64> },
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[derive(Default)]
struct Waiters {
    by_key: HashMap<Vec<u8>, VecDeque<Arc<Notify>>>,
}

impl Waiters {
    fn register(&mut self, key: &[u8]) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.by_key
            .entry(key.to_vec())
            .or_default()
            .push_back(notify.clone());
        notify
    }

    fn remove(&mut self, key: &[u8], notify: &Arc<Notify>) {
        if let Some(queue) = self.by_key.get_mut(key) {
            queue.retain(|n| !Arc::ptr_eq(n, notify));
            if queue.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// Wake the single oldest waiter on `key`, if any.
    fn wake_one(&mut self, key: &[u8]) {
        if let Some(queue) = self.by_key.get_mut(key) {
            if let Some(notify) = queue.pop_front() {
                notify.notify_one();
            }
            if queue.is_empty() {
                self.by_key.remove(key);
            }
        }
    }
}

/// Thread-safe key-value store. All operations are atomic with respect to
/// concurrent callers; a single mutex guards the whole key space, matching
/// the reference implementation's single-lock design.
pub struct Store {
    inner: Mutex<HashMap<Vec<u8>, Entry>>,
    waiters: Mutex<Waiters>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Waiters::default()),
        }
    }

    /// Install a snapshot-loaded string entry without going through the
    /// waiter/propagation path used by live writes.
    pub fn load_string(&self, key: Vec<u8>, value: Bytes, expiry: Option<i64>) {
        self.inner
            .lock()
            .unwrap()
            .insert(key, Entry::String { bytes: value, expiry });
    }

    pub fn set(&self, key: Vec<u8>, value: Bytes, expiry: Option<i64>) {
        self.inner
            .lock()
            .unwrap()
            .insert(key, Entry::String { bytes: value, expiry });
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(key) {
            Some(Entry::String { bytes, expiry }) => {
                if expired(*expiry) {
                    guard.remove(key);
                    None
                } else {
                    Some(bytes.clone())
                }
            }
            _ => None,
        }
    }

    pub fn del(&self, keys: &[Vec<u8>]) -> usize {
        let mut guard = self.inner.lock().unwrap();
        keys.iter().filter(|k| guard.remove(k.as_slice()).is_some()).count()
    }

    /// Snapshot of keys matching `pattern`. Only the `*` wildcard (match-all)
    /// is supported; any other pattern returns an empty list.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        if pattern != b"*" {
            return Vec::new();
        }
        let mut guard = self.inner.lock().unwrap();
        let now = now_ms();
        guard.retain(|_, entry| match entry {
            Entry::String { expiry, .. } => !expired_at(*expiry, now),
            Entry::List { .. } => true,
        });
        guard.keys().cloned().collect()
    }

    fn push(&self, key: Vec<u8>, values: Vec<Bytes>, front: bool) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard
            .entry(key.clone())
            .or_insert_with(|| Entry::List { items: VecDeque::new(), expiry: None });

        if let Entry::String { bytes, expiry } = entry {
            let mut items = VecDeque::with_capacity(1);
            items.push_back(bytes.clone());
            *entry = Entry::List { items, expiry: *expiry };
        }

        let (was_empty, new_len) = match entry {
            Entry::List { items, .. } => {
                let was_empty = items.is_empty();
                if front {
                    for v in values {
                        items.push_front(v);
                    }
                } else {
                    for v in values {
                        items.push_back(v);
                    }
                }
                (was_empty, items.len())
            }
            Entry::String { .. } => unreachable!("coerced to list above"),
        };
        drop(guard);

        if was_empty {
            self.waiters.lock().unwrap().wake_one(&key);
        }
        new_len
    }

    pub fn rpush(&self, key: Vec<u8>, values: Vec<Bytes>) -> usize {
        self.push(key, values, false)
    }

    /// `LPUSH key v1 v2 v3` prepends each value in argument order, so `v3`
    /// ends up at the head and `v1` deepest among the newly pushed values.
    pub fn lpush(&self, key: Vec<u8>, values: Vec<Bytes>) -> usize {
        self.push(key, values, true)
    }

    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<Bytes> {
        let guard = self.inner.lock().unwrap();
        let Some(Entry::List { items, .. }) = guard.get(key) else {
            return Vec::new();
        };
        let len = items.len() as i64;
        if len == 0 {
            return Vec::new();
        }
        let start = clamp_index(start, len).max(0);
        let stop = clamp_index(stop, len).min(len - 1);
        if start > stop {
            return Vec::new();
        }
        items
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect()
    }

    pub fn llen(&self, key: &[u8]) -> usize {
        let guard = self.inner.lock().unwrap();
        match guard.get(key) {
            Some(Entry::List { items, .. }) => items.len(),
            _ => 0,
        }
    }

    /// Pop up to `n` elements from the head. `None` if the key is missing or
    /// not a list; `Some(vec![])` is never returned for a missing key — an
    /// existing but exhausted list is simply removed.
    pub fn lpop(&self, key: &[u8], n: usize) -> Option<Vec<Bytes>> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(key) {
            Some(Entry::List { items, .. }) => {
                let mut popped = Vec::with_capacity(n.min(items.len()));
                for _ in 0..n {
                    match items.pop_front() {
                        Some(v) => popped.push(v),
                        None => break,
                    }
                }
                if items.is_empty() {
                    guard.remove(key);
                }
                Some(popped)
            }
            _ => None,
        }
    }

    fn try_pop_one(&self, key: &[u8]) -> Option<Bytes> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get_mut(key) {
            Some(Entry::List { items, .. }) => {
                let v = items.pop_front();
                if items.is_empty() {
                    guard.remove(key);
                }
                v
            }
            _ => None,
        }
    }

    /// Block until `key` has an element to pop, or `timeout_secs` elapses.
    /// `timeout_secs == 0` blocks indefinitely.
    pub async fn blpop(&self, key: &[u8], timeout_secs: f64) -> Option<(Vec<u8>, Bytes)> {
        let deadline = if timeout_secs > 0.0 {
            Some(Instant::now() + Duration::from_secs_f64(timeout_secs))
        } else {
            None
        };

        loop {
            // Register before checking the list: a push between the check and
            // the registration could wake an empty queue and strand us. Once
            // registered, a concurrent push's `wake_one` either finds us in
            // the queue (and the stored permit makes our `notified().await`
            // below resolve immediately) or it already inserted the element
            // before we registered, in which case `try_pop_one` sees it.
            let notify = self.waiters.lock().unwrap().register(key);
            if let Some(value) = self.try_pop_one(key) {
                self.waiters.lock().unwrap().remove(key, &notify);
                return Some((key.to_vec(), value));
            }

            let notified = notify.notified();

            match deadline {
                None => notified.await,
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        self.waiters.lock().unwrap().remove(key, &notify);
                        return None;
                    }
                }
            }
            // Woken (or spuriously retrying): loop back and recontest the list.
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn expired(expiry: Option<i64>) -> bool {
    expired_at(expiry, now_ms())
}

fn expired_at(expiry: Option<i64>, now: i64) -> bool {
    matches!(expiry, Some(exp) if now >= exp)
}

fn clamp_index(index: i64, len: i64) -> i64 {
    if index < 0 {
        (len + index).max(0)
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = Store::new();
        store.set(b"k".to_vec(), b("v"), None);
        assert_eq!(store.get(b"k"), Some(b("v")));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn expiry_is_lazy_and_removes_on_read() {
        let store = Store::new();
        store.set(b"k".to_vec(), b("v"), Some(now_ms() - 1));
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.keys(b"*"), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn rpush_and_lrange_preserve_insertion_order() {
        let store = Store::new();
        assert_eq!(store.rpush(b"l".to_vec(), vec![b("a"), b("b"), b("c")]), 3);
        assert_eq!(store.lrange(b"l", 0, -1), vec![b("a"), b("b"), b("c")]);
        assert_eq!(store.llen(b"l"), 3);
    }

    #[test]
    fn lpush_prepends_in_argument_order() {
        let store = Store::new();
        store.lpush(b"l".to_vec(), vec![b("a"), b("b"), b("c")]);
        // c ends up at the head, a deepest among the pushed values.
        assert_eq!(store.lrange(b"l", 0, -1), vec![b("c"), b("b"), b("a")]);
    }

    #[test]
    fn lrange_clamps_out_of_range_indices() {
        let store = Store::new();
        store.rpush(b"l".to_vec(), vec![b("a"), b("b")]);
        assert_eq!(store.lrange(b"l", -100, 100), vec![b("a"), b("b")]);
        assert_eq!(store.lrange(b"l", 5, 10), Vec::<Bytes>::new());
        assert_eq!(store.lrange(b"missing", 0, -1), Vec::<Bytes>::new());
    }

    #[test]
    fn llen_is_pushes_minus_pops() {
        let store = Store::new();
        store.rpush(b"l".to_vec(), vec![b("a"), b("b"), b("c")]);
        store.lpop(b"l", 2);
        assert_eq!(store.llen(b"l"), 1);
    }

    #[test]
    fn rpush_coerces_existing_string_into_single_element_list() {
        let store = Store::new();
        store.set(b"k".to_vec(), b("old"), None);
        let len = store.rpush(b"k".to_vec(), vec![b("new")]);
        assert_eq!(len, 2);
        assert_eq!(store.lrange(b"k", 0, -1), vec![b("old"), b("new")]);
    }

    #[tokio::test]
    async fn blpop_returns_immediately_when_list_nonempty() {
        let store = Store::new();
        store.rpush(b"l".to_vec(), vec![b("x")]);
        let result = store.blpop(b"l", 1.0).await;
        assert_eq!(result, Some((b"l".to_vec(), b("x"))));
    }

    #[tokio::test]
    async fn blpop_times_out_on_empty_list() {
        let store = Store::new();
        let result = store.blpop(b"l", 0.05).await;
        assert_eq!(result, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blpop_wakes_exactly_one_waiter_per_push() {
        let store = Arc::new(Store::new());

        let w1 = tokio::spawn({
            let store = store.clone();
            async move { store.blpop(b"l", 0.0).await }
        });
        let w2 = tokio::spawn({
            let store = store.clone();
            async move { store.blpop(b"l", 0.0).await }
        });

        // Give both waiters a chance to register before the push.
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush(b"l".to_vec(), vec![b("x")]);

        let timeout_each = Duration::from_millis(200);
        let r1 = tokio::time::timeout(timeout_each, w1).await;
        let r2 = tokio::time::timeout(timeout_each, w2).await;

        let woke: Vec<_> = [r1, r2]
            .into_iter()
            .filter_map(|r| r.ok().and_then(|r| r.unwrap()))
            .collect();
        assert_eq!(woke.len(), 1);
        assert_eq!(woke[0], (b"l".to_vec(), b("x")));
    }
}
