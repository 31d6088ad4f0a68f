// SPDX-License-Identifier: Apache-2.0

//! Round arithmetic and the injected time source.
//!
//! Every wall-clock read in the engine goes through [`Clock`] so tests can
//! drive rounds with a fake source advancing in discrete steps.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tokio::sync::oneshot;

/// Rounds inserted between DKG output and the new epoch taking over.
pub const ROUNDS_UNTIL_TRANSITION: u64 = 10;

/// Calculates the active round at `now`. 0 means "pre-genesis".
pub fn current_round(now: u64, period: u32, genesis: u64) -> u64 {
    let (next_round, _) = next_round(now, period, genesis);
    next_round - 1
}

/// Returns the next upcoming round and its UNIX time given the genesis
/// time and the period. Round 1 starts at genesis.
pub fn next_round(now: u64, period: u32, genesis: u64) -> (u64, u64) {
    if now < genesis {
        return (1, genesis);
    }
    let from_genesis = now - genesis;
    // Periods elapsed since genesis, +1 for the next one, +1 because
    // round 1 already occupies the genesis instant.
    let next_round = from_genesis / u64::from(period) + 1;
    let next_time = genesis + next_round * u64::from(period);

    (next_round + 1, next_time)
}

/// Returns the time the `round` should happen.
pub fn time_of_round(period: u32, genesis: u64, round: u64) -> u64 {
    if round == 0 {
        return genesis;
    }
    // -1 because genesis time is for the 1st round already.
    genesis + (round - 1) * u64::from(period)
}

/// Injected source of UNIX time plus the ability to wait for a deadline.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Duration;

    fn sleep_until(&self, deadline: Duration) -> impl Future<Output = ()> + Send;
}

/// Production source backed by [`SystemTime`] and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
    }

    async fn sleep_until(&self, deadline: Duration) {
        if let Some(wait) = deadline.checked_sub(self.now()) {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Deterministic source for tests: time moves only on [`FakeClock::advance`],
/// which wakes every sleeper whose deadline has been reached.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    inner: Arc<FakeClockInner>,
}

#[derive(Debug, Default)]
struct FakeClockInner {
    now_secs: AtomicU64,
    sleepers: Mutex<Vec<(u64, oneshot::Sender<()>)>>,
}

impl FakeClock {
    pub fn at(now_secs: u64) -> Self {
        let clock = Self::default();
        clock.inner.now_secs.store(now_secs, Ordering::SeqCst);
        clock
    }

    pub fn advance(&self, step: Duration) {
        let now = self
            .inner
            .now_secs
            .fetch_add(step.as_secs(), Ordering::SeqCst)
            + step.as_secs();

        let mut sleepers = self.inner.sleepers.lock().expect("fake clock poisoned");
        let due: Vec<_> = {
            let mut kept = Vec::with_capacity(sleepers.len());
            let mut woken = vec![];
            for (deadline, tx) in sleepers.drain(..) {
                if deadline <= now {
                    woken.push(tx);
                } else {
                    kept.push((deadline, tx));
                }
            }
            *sleepers = kept;
            woken
        };
        for tx in due {
            let _ = tx.send(());
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        Duration::from_secs(self.inner.now_secs.load(Ordering::SeqCst))
    }

    async fn sleep_until(&self, deadline: Duration) {
        let rx = {
            let mut sleepers = self.inner.sleepers.lock().expect("fake clock poisoned");
            if self.now() >= deadline {
                return;
            }
            let (tx, rx) = oneshot::channel();
            sleepers.push((deadline.as_secs(), tx));
            rx
        };
        // Sender dropped means the clock itself is gone; resolve anyway.
        let _ = rx.await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn next_round_progression() {
        let period = 2;
        let mut now = 10_000;
        let genesis = now + 1;

        // Move to genesis round.
        now += 1;
        let (round, round_time) = next_round(now, period, genesis);
        assert_eq!(round, 2);
        let exp_time = genesis + u64::from(period);
        assert_eq!(exp_time, round_time);
        assert_eq!(exp_time, time_of_round(period, genesis, 2));

        // One second in, still the same upcoming round.
        now += 1;
        let (nround, nround_time) = next_round(now, period, genesis);
        assert_eq!(round, nround);
        assert_eq!(round_time, nround_time);

        // Move to next round.
        now += 1;
        let (round, round_time) = next_round(now, period, genesis);
        let exp_time = genesis + u64::from(period) * 2;
        assert_eq!(round, 3);
        assert_eq!(round_time, exp_time);
        assert_eq!(exp_time, time_of_round(period, genesis, 3));
    }

    #[test]
    fn current_round_pre_genesis_is_zero() {
        let genesis = 1000;
        assert_eq!(current_round(999, 2, genesis), 0);
        assert_eq!(current_round(1000, 2, genesis), 1);
        assert_eq!(current_round(1001, 2, genesis), 1);
        assert_eq!(current_round(1002, 2, genesis), 2);
    }

    #[tokio::test]
    async fn fake_clock_wakes_sleepers_in_steps() {
        let clock = FakeClock::at(100);
        let task = tokio::spawn({
            let clock = clock.clone();
            async move { clock.sleep_until(Duration::from_secs(104)).await }
        });
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(2));
        assert!(!task.is_finished());

        clock.advance(Duration::from_secs(2));
        task.await.unwrap();
        assert_eq!(clock.now(), Duration::from_secs(104));
    }
}
