//! Single-flight coalescing of upstream fetches per fingerprint.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::sync::watch;

use super::Fingerprint;

/// Role of a request in a flight
#[derive(Debug)]
pub enum Flight {
    /// Fetch upstream, then [`Flights::land`].
    Leader(watch::Sender<bool>),
    /// Wait for the leader with [`Flights::wait`].
    Follower(watch::Receiver<bool>),
}

#[derive(Debug, Default)]
pub struct Flights {
    inflight: DashMap<Fingerprint, watch::Receiver<bool>>,
}

impl Flights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, becoming its leader when none is in the air.
    /// Check and insert happen under the same shard lock.
    pub fn join(&self, key: Fingerprint) -> Flight {
        match self.inflight.entry(key) {
            Entry::Occupied(occupied) => Flight::Follower(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx);
                Flight::Leader(tx)
            }
        }
    }

    /// End the flight and wake its followers.
    pub fn land(&self, key: &Fingerprint, done: watch::Sender<bool>) {
        self.inflight.remove(key);
        let _ = done.send(true);
    }

    /// Wait for the leader to land, at most `bound`. Returns `false` on
    /// timeout. A leader that vanished without landing counts as landed.
    pub async fn wait(mut follower: watch::Receiver<bool>, bound: Duration) -> bool {
        let landed = tokio::time::timeout(bound, follower.wait_for(|done| *done))
            .await
            .is_ok();
        landed
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_leader_many_followers() {
        let flights = Flights::new();
        let key = Fingerprint(1);
        let Flight::Leader(tx) = flights.join(key) else {
            panic!("first join must lead");
        };
        let followers: Vec<_> = (0..3)
            .map(|_| match flights.join(key) {
                Flight::Follower(rx) => rx,
                Flight::Leader(_) => panic!("second join must follow"),
            })
            .collect();
        assert_eq!(flights.len(), 1);

        let waits: Vec<_> = followers
            .into_iter()
            .map(|rx| tokio::spawn(Flights::wait(rx, Duration::from_secs(5))))
            .collect();
        flights.land(&key, tx);
        for wait in waits {
            assert!(wait.await.unwrap());
        }
        assert!(flights.is_empty());
        assert!(matches!(flights.join(key), Flight::Leader(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_times_out() {
        let flights = Flights::new();
        let key = Fingerprint(2);
        let _leader = flights.join(key);
        let Flight::Follower(rx) = flights.join(key) else {
            panic!("expected follower");
        };
        assert!(!Flights::wait(rx, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let flights = Flights::new();
        let key = Fingerprint(3);
        let leader = flights.join(key);
        let Flight::Follower(rx) = flights.join(key) else {
            panic!("expected follower");
        };
        drop(leader);
        // wait_for errors once the sender is gone; still not a timeout.
        assert!(Flights::wait(rx, Duration::from_secs(1)).await);
    }
}
