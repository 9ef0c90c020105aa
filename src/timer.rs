// timer.rs - One-shot timers delivered as events on an owner's queue

use ahash::AHashMap;
use serde::Deserialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

/// RFC 3261 timer base values, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// RTT estimate
    pub t1_ms: u64,

    /// Maximum retransmit interval for non-INVITE requests and INVITE responses
    pub t2_ms: u64,

    /// Maximum time a message stays in the network
    pub t4_ms: u64,

    /// Wait time for response retransmits (Timer D)
    pub timer_d_ms: u64,

    /// Timer B after a provisional response; 64·T1 when unset
    pub proceeding_timeout_ms: Option<u64>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            timer_d_ms: 32_000,
            proceeding_timeout_ms: None,
        }
    }
}

impl TimerConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }

    /// 64·T1, the transaction timeout used by Timers B, F, H, J, L and M.
    pub fn transaction_timeout(&self) -> Duration {
        self.t1() * 64
    }

    pub fn timer_d(&self) -> Duration {
        Duration::from_millis(self.timer_d_ms)
    }

    /// Restarted Timer B once a provisional arrived.
    pub fn proceeding_timeout(&self) -> Duration {
        self.proceeding_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.transaction_timeout())
    }
}

/// Retransmit interval for the given attempt: `base · 2^attempt`, capped.
pub fn backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// A scheduled firing. Dropping the handle does not cancel it; call `stop`.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct TimerService;

impl TimerService {
    /// Schedule `event` onto `queue` after `delay` on the runtime's clock.
    pub fn start<E>(id: u64, delay: Duration, queue: &UnboundedSender<E>, event: E) -> TimerHandle
    where
        E: Send + 'static,
    {
        let queue = queue.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The owner may already be gone
            let _ = queue.send(event);
        });
        TimerHandle { id, task }
    }

    pub fn stop(handle: TimerHandle) {
        handle.task.abort();
    }
}

/// Firing of a timer owned by a `TimerSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<K> {
    pub kind: K,
    pub id: u64,
}

/// Timers of one owner keyed by kind; at most one armed per kind.
pub struct TimerSet<K> {
    next_id: u64,
    armed: AHashMap<K, TimerHandle>,
}

impl<K> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            next_id: 0,
            armed: AHashMap::new(),
        }
    }
}

impl<K> TimerSet<K>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind`, replacing any earlier arming of the same kind.
    pub fn start<E>(&mut self, kind: K, delay: Duration, queue: &UnboundedSender<E>)
    where
        E: From<Expired<K>> + Send + 'static,
    {
        self.stop(kind);
        self.next_id += 1;
        let id = self.next_id;
        trace!(?kind, ?delay, id, "timer armed");
        let handle = TimerService::start(id, delay, queue, E::from(Expired { kind, id }));
        self.armed.insert(kind, handle);
    }

    pub fn stop(&mut self, kind: K) {
        if let Some(handle) = self.armed.remove(&kind) {
            TimerService::stop(handle);
        }
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            TimerService::stop(handle);
        }
    }

    pub fn is_armed(&self, kind: K) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Accept a firing only if it belongs to the current arming of its kind.
    pub fn accept(&mut self, expired: Expired<K>) -> bool {
        match self.armed.get(&expired.kind) {
            Some(handle) if handle.id() == expired.id => {
                self.armed.remove(&expired.kind);
                true
            }
            _ => {
                trace!(kind = ?expired.kind, id = expired.id, "stale timer firing ignored");
                false
            }
        }
    }
}

impl<K> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Retransmit,
        Timeout,
    }

    #[derive(Debug, PartialEq)]
    struct Fired(Expired<Kind>);

    impl From<Expired<Kind>> for Fired {
        fn from(expired: Expired<Kind>) -> Self {
            Fired(expired)
        }
    }

    #[test]
    fn test_default_timer_values() {
        let config = TimerConfig::default();
        assert_eq!(config.t1(), Duration::from_millis(500));
        assert_eq!(config.transaction_timeout(), Duration::from_secs(32));
        assert_eq!(config.timer_d(), Duration::from_secs(32));
        assert_eq!(config.t4(), Duration::from_secs(5));
        assert_eq!(config.proceeding_timeout(), config.transaction_timeout());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: TimerConfig = serde_json::from_str(r#"{"t1_ms": 100}"#).unwrap();
        assert_eq!(config.transaction_timeout(), Duration::from_millis(6400));
        assert_eq!(config.t2(), Duration::from_secs(4));
        assert_eq!(config.proceeding_timeout(), Duration::from_millis(6400));

        let ringing: TimerConfig = serde_json::from_str(r#"{"proceeding_timeout_ms": 180000}"#).unwrap();
        assert_eq!(ringing.proceeding_timeout(), Duration::from_secs(180));
        assert_eq!(ringing.transaction_timeout(), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Fired>();
        let mut timers = TimerSet::new();
        timers.start(Kind::Timeout, Duration::from_secs(32), &tx);

        tokio::time::sleep(Duration::from_millis(31_999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let Fired(expired) = rx.recv().await.unwrap();
        assert_eq!(expired.kind, Kind::Timeout);
        assert!(timers.accept(expired));
        assert!(!timers.is_armed(Kind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Fired>();
        let mut timers = TimerSet::new();
        timers.start(Kind::Retransmit, Duration::from_millis(500), &tx);
        timers.stop(Kind::Retransmit);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_rejects_stale_firing() {
        let (tx, _rx) = mpsc::unbounded_channel::<Fired>();
        let mut timers = TimerSet::new();
        timers.start(Kind::Retransmit, Duration::from_millis(500), &tx);
        let stale = Expired {
            kind: Kind::Retransmit,
            id: 1,
        };
        timers.start(Kind::Retransmit, Duration::from_millis(1000), &tx);

        assert!(!timers.accept(stale));
        assert!(timers.is_armed(Kind::Retransmit));
    }

    #[test]
    fn test_backoff_sequence() {
        let t1 = Duration::from_millis(500);
        let t2 = Duration::from_secs(4);
        let intervals: Vec<u64> = (0..6)
            .map(|n| backoff(t1, n, t2).as_millis() as u64)
            .collect();
        assert_eq!(intervals, vec![500, 1000, 2000, 4000, 4000, 4000]);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(base_ms in 1u64..10_000, attempt in 0u32..64, cap_ms in 1u64..100_000) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(cap_ms);
            let current = backoff(base, attempt, cap);
            prop_assert!(current <= cap);
            prop_assert!(backoff(base, attempt + 1, cap) >= current);
        }
    }
}
