use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Collapses concurrent derivative generations for the same blob name.
///
/// The first caller for a key becomes the leader; later callers get a waiter
/// permit and are woken when the leader's permit drops, whether it succeeded
/// or not. Waiters re-check the cache afterwards instead of receiving a value.
#[derive(Clone, Default)]
pub struct Singleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl Singleflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> SingleflightPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => SingleflightPermit {
                key: key.to_string(),
                notify: entry.get().clone(),
                is_leader: false,
                inner: self.inner.clone(),
            },
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                SingleflightPermit {
                    key: key.to_string(),
                    notify,
                    is_leader: true,
                    inner: self.inner.clone(),
                }
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inner.len()
    }
}

pub struct SingleflightPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl SingleflightPermit {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Waits for the leader to finish. Returns `false` once `deadline` passes.
    pub async fn wait_result(self, deadline: Instant) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let still_running = self
            .inner
            .get(&self.key)
            .map(|entry| Arc::ptr_eq(entry.value(), &self.notify))
            .unwrap_or(false);
        if !still_running {
            return true;
        }
        tokio::time::timeout_at(deadline, notified).await.is_ok()
    }
}

impl Drop for SingleflightPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn first_caller_leads_and_followers_wait() {
        let flights = Singleflight::new();
        let leader = flights.acquire("a_wm_1024_v1.jpg");
        let follower = flights.acquire("a_wm_1024_v1.jpg");
        let other = flights.acquire("a_wm_2048_v1.jpg");
        assert!(leader.is_leader());
        assert!(!follower.is_leader());
        assert!(other.is_leader());

        let waiting = tokio::spawn(follower.wait_result(in_ms(5_000)));
        tokio::task::yield_now().await;
        drop(leader);
        assert!(waiting.await.unwrap());
        drop(other);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn follower_of_finished_leader_returns_immediately() {
        let flights = Singleflight::new();
        let leader = flights.acquire("k");
        let follower = flights.acquire("k");
        drop(leader);
        assert!(follower.wait_result(in_ms(10)).await);
        assert!(flights.acquire("k").is_leader());
    }

    #[tokio::test]
    async fn follower_times_out_while_leader_holds() {
        let flights = Singleflight::new();
        let _leader = flights.acquire("k");
        let follower = flights.acquire("k");
        assert!(!follower.wait_result(in_ms(20)).await);
    }

    #[tokio::test]
    async fn past_deadline_does_not_wait() {
        let flights = Singleflight::new();
        let _leader = flights.acquire("k");
        let follower = flights.acquire("k");
        let started = std::time::Instant::now();
        assert!(!follower.wait_result(Instant::now()).await);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
