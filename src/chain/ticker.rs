use super::time;
use super::time::Clock;
use crate::net::utils::Seconds;
use std::time::Duration;
use tokio::sync::mpsc;

type Round = u64;

struct RoundTicker<C: Clock> {
    clock: C,
    period: u32,
    genesis_time: u64,
    tx_next_round: mpsc::Sender<Round>,
}

impl<C: Clock> RoundTicker<C> {
    /// Sends next round value at next round time to associated receiver.
    async fn send_next_round(&self) -> Result<(), mpsc::error::SendError<Round>> {
        let (next_round, next_time) = time::next_round(
            self.clock.now().as_secs(),
            self.period,
            self.genesis_time,
        );

        self.clock
            .sleep_until(Duration::from_secs(next_time))
            .await;
        self.tx_next_round.send(next_round).await
    }
}

/// Starts the round ticker for given genesis time and period. Returns the
/// associated receiver for new rounds; dropping it cancels the ticker.
pub fn start_ticker<C: Clock>(
    clock: C,
    genesis_time: u64,
    period: Seconds,
) -> mpsc::Receiver<Round> {
    let (tx_next_round, rx_next_round) = mpsc::channel(1);

    tokio::spawn(async move {
        let t = RoundTicker {
            clock,
            period: period.get_value(),
            genesis_time,
            tx_next_round,
        };

        loop {
            if t.send_next_round().await.is_err() {
                break;
            }
        }
    });

    rx_next_round
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::time::FakeClock;

    #[tokio::test]
    async fn ticks_follow_fake_clock() {
        let genesis = 1_000;
        let clock = FakeClock::at(genesis - 2);
        let mut rx = start_ticker(clock.clone(), genesis, Seconds::new(2));
        tokio::task::yield_now().await;

        // Pre-genesis: nothing fires.
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_secs(2));
        assert_eq!(rx.recv().await, Some(1));

        clock.advance(Duration::from_secs(2));
        assert_eq!(rx.recv().await, Some(2));

        clock.advance(Duration::from_secs(2));
        assert_eq!(rx.recv().await, Some(3));
    }
}
