//! [`OperationLock`] – exclusive command lease per robot.
//!
//! A user acquires a lease for `lease_duration`.  Re-acquiring by the holder
//! extends it; anyone else is refused until the lease is released or expires.
//! Expired leases are treated as absent by every read and are physically
//! removed by [`sweep_expired`][OperationLock::sweep_expired], which
//! [`run_sweeper`][OperationLock::run_sweeper] calls on a fixed interval.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use robogate_types::{GateError, LockInfo};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// How often [`OperationLock::run_sweeper`] scans for expired leases.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Lease map keyed by robot ID.
pub struct OperationLock {
    leases: RwLock<HashMap<String, LockInfo>>,
    lease_duration: TimeDelta,
}

impl OperationLock {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration: TimeDelta::from_std(lease_duration).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Acquire or extend the lease on `robot_id` for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::LockHeld`] with the current holder when another
    /// user holds a live lease.
    #[instrument(skip(self))]
    pub async fn acquire(&self, robot_id: &str, user_id: &str) -> Result<LockInfo, GateError> {
        self.acquire_at(robot_id, user_id, Utc::now()).await
    }

    /// [`acquire`][Self::acquire] against an explicit clock reading.
    pub async fn acquire_at(
        &self,
        robot_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LockInfo, GateError> {
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }
        let expires_at = now
            .checked_add_signed(self.lease_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut leases = self.leases.write().await;
        match leases.get_mut(robot_id) {
            Some(lease) if !lease.is_expired_at(now) && lease.user_id != user_id => {
                Err(GateError::LockHeld {
                    robot_id: robot_id.to_string(),
                    holder: lease.user_id.clone(),
                    expires_at: lease.expires_at,
                })
            }
            Some(lease) if !lease.is_expired_at(now) => {
                lease.expires_at = expires_at;
                debug!(robot_id, user_id, %expires_at, "operation lock extended");
                Ok(lease.clone())
            }
            _ => {
                let lease = LockInfo {
                    robot_id: robot_id.to_string(),
                    user_id: user_id.to_string(),
                    acquired_at: now,
                    expires_at,
                };
                leases.insert(robot_id.to_string(), lease.clone());
                info!(robot_id, user_id, %expires_at, "operation lock acquired");
                Ok(lease)
            }
        }
    }

    /// Release the lease on `robot_id`.
    ///
    /// Releasing a robot with no live lease succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotLockHolder`] when another user holds the lease.
    pub async fn release(&self, robot_id: &str, user_id: &str) -> Result<(), GateError> {
        self.release_at(robot_id, user_id, Utc::now()).await
    }

    pub async fn release_at(
        &self,
        robot_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GateError> {
        let mut leases = self.leases.write().await;
        match leases.get(robot_id) {
            None => Ok(()),
            Some(lease) if lease.is_expired_at(now) => {
                leases.remove(robot_id);
                Ok(())
            }
            Some(lease) if lease.user_id != user_id => Err(GateError::NotLockHolder {
                robot_id: robot_id.to_string(),
                holder: lease.user_id.clone(),
            }),
            Some(_) => {
                leases.remove(robot_id);
                info!(robot_id, user_id, "operation lock released");
                Ok(())
            }
        }
    }

    /// The live lease on `robot_id`, if any.
    pub async fn holder(&self, robot_id: &str) -> Option<LockInfo> {
        self.holder_at(robot_id, Utc::now()).await
    }

    pub async fn holder_at(&self, robot_id: &str, now: DateTime<Utc>) -> Option<LockInfo> {
        self.leases
            .read()
            .await
            .get(robot_id)
            .filter(|lease| !lease.is_expired_at(now))
            .cloned()
    }

    pub async fn is_held_by(&self, robot_id: &str, user_id: &str) -> bool {
        self.holder(robot_id)
            .await
            .is_some_and(|lease| lease.user_id == user_id)
    }

    /// Remove and return every lease that has expired at `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<LockInfo> {
        let mut leases = self.leases.write().await;
        let expired_ids: Vec<String> = leases
            .iter()
            .filter(|(_, lease)| lease.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired: Vec<LockInfo> = expired_ids
            .iter()
            .filter_map(|id| leases.remove(id))
            .collect();
        expired.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        expired
    }

    pub async fn sweep_expired(&self) -> Vec<LockInfo> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Sweep expired leases every `interval` until `cancel` fires.
    ///
    /// `on_expired` runs once per removed lease, after the map lock is
    /// released.
    pub async fn run_sweeper<F>(&self, interval: Duration, cancel: CancellationToken, on_expired: F)
    where
        F: Fn(&LockInfo),
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for lease in self.sweep_expired().await {
                        info!(robot_id = %lease.robot_id, user_id = %lease.user_id, "operation lock expired");
                        on_expired(&lease);
                    }
                }
            }
        }
        debug!("lock sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock() -> OperationLock {
        OperationLock::new(Duration::from_secs(300))
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn acquire_free_robot() {
        let ol = lock();
        let lease = ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        assert_eq!(lease.user_id, "alice");
        assert_eq!(lease.expires_at, t0() + TimeDelta::seconds(300));
        assert!(ol.is_held_by("robot-1", "alice").await);
    }

    #[tokio::test]
    async fn holder_reacquire_extends_lease() {
        let ol = lock();
        let first = ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        let later = t0() + TimeDelta::seconds(100);
        let second = ol.acquire_at("robot-1", "alice", later).await.unwrap();
        assert_eq!(second.acquired_at, first.acquired_at);
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn competing_user_is_refused_with_holder() {
        let ol = lock();
        ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        let err = ol
            .acquire_at("robot-1", "bob", t0() + TimeDelta::seconds(1))
            .await
            .unwrap_err();
        match err {
            GateError::LockHeld {
                holder, expires_at, ..
            } => {
                assert_eq!(holder, "alice");
                assert_eq!(expires_at, t0() + TimeDelta::seconds(300));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let ol = lock();
        ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        let after = t0() + TimeDelta::seconds(300);
        let lease = ol.acquire_at("robot-1", "bob", after).await.unwrap();
        assert_eq!(lease.user_id, "bob");
        assert_eq!(lease.acquired_at, after);
    }

    #[tokio::test]
    async fn release_rules() {
        let ol = lock();
        // No lock: idempotent success.
        ol.release_at("robot-1", "alice", t0()).await.unwrap();

        ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        let err = ol.release_at("robot-1", "bob", t0()).await.unwrap_err();
        assert!(matches!(err, GateError::NotLockHolder { holder, .. } if holder == "alice"));

        ol.release_at("robot-1", "alice", t0()).await.unwrap();
        assert!(ol.holder_at("robot-1", t0()).await.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_invisible_and_swept() {
        let ol = lock();
        ol.acquire_at("robot-1", "alice", t0()).await.unwrap();
        ol.acquire_at("robot-2", "bob", t0() + TimeDelta::seconds(200))
            .await
            .unwrap();

        let now = t0() + TimeDelta::seconds(301);
        assert!(ol.holder_at("robot-1", now).await.is_none());
        assert!(ol.holder_at("robot-2", now).await.is_some());

        let swept = ol.sweep_expired_at(now).await;
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].robot_id, "robot-1");
        assert!(ol.sweep_expired_at(now).await.is_empty());
    }

    #[tokio::test]
    async fn at_most_one_live_lease_under_contention() {
        let ol = Arc::new(lock());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let ol = Arc::clone(&ol);
            tasks.push(tokio::spawn(async move {
                ol.acquire("robot-1", &format!("user-{i}")).await.is_ok()
            }));
        }
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn empty_robot_id_is_rejected() {
        let ol = lock();
        assert!(matches!(
            ol.acquire("", "alice").await,
            Err(GateError::MissingRobotId)
        ));
    }

    #[tokio::test]
    async fn sweeper_reports_expired_leases_and_stops_on_cancel() {
        let ol = Arc::new(OperationLock::new(Duration::from_millis(0)));
        ol.acquire("robot-1", "alice").await.unwrap();

        let cancel = CancellationToken::new();
        let expired = Arc::new(AtomicUsize::new(0));
        let task = {
            let ol = Arc::clone(&ol);
            let cancel = cancel.clone();
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                ol.run_sweeper(Duration::from_millis(5), cancel, |_| {
                    expired.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(expired.load(Ordering::SeqCst), 1);
    }
}
