use super::Beacon;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::Span;

/// Capacity of one subscriber mailbox. A consumer lagging this far
/// behind is dropped rather than allowed to stall the engine.
const SUBSCRIBER_BUFFER: usize = 64;

pub type SubscriberId = u64;

/// Fan-out of newly stored beacons. Delivery is invoked synchronously in
/// store order after each successful put; a failing delivery removes the
/// subscriber, so streams observe at-least-once semantics until they
/// disconnect.
pub struct CallbackRegistry {
    subscribers: Vec<(SubscriberId, mpsc::Sender<Beacon>)>,
    next_id: SubscriberId,
    log: Span,
}

impl CallbackRegistry {
    pub fn new(log: Span) -> Self {
        Self {
            subscribers: vec![],
            next_id: 0,
            log,
        }
    }

    /// Registers a new subscriber, returning its mailbox and an id
    /// usable with [`CallbackRegistry::remove`].
    pub fn add(&mut self) -> (SubscriberId, mpsc::Receiver<Beacon>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, tx));
        debug!(parent: &self.log, "callbacks: subscriber {id} added, total {}", self.subscribers.len());

        (id, rx)
    }

    pub fn remove(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Delivers `beacon` to every subscriber, dropping the ones whose
    /// mailbox is closed or full.
    pub fn notify(&mut self, beacon: &Beacon) {
        let log = &self.log;
        self.subscribers.retain(|(id, tx)| {
            if let Err(err) = tx.try_send(beacon.clone()) {
                debug!(parent: log, "callbacks: removing subscriber {id}: {err}");
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing::info_span;

    fn beacon(round: u64) -> Beacon {
        Beacon {
            round,
            previous_round: round.saturating_sub(1),
            previous_sig: vec![],
            signature: round.to_be_bytes().into(),
        }
    }

    #[tokio::test]
    async fn delivers_in_store_order() {
        let mut registry = CallbackRegistry::new(info_span!("cb_test"));
        let (_, mut rx) = registry.add();

        registry.notify(&beacon(1));
        registry.notify(&beacon(2));

        assert_eq!(rx.recv().await.unwrap().round, 1);
        assert_eq!(rx.recv().await.unwrap().round, 2);
    }

    #[tokio::test]
    async fn failed_delivery_removes_subscriber() {
        let mut registry = CallbackRegistry::new(info_span!("cb_test"));
        let (_, rx) = registry.add();
        let (_, mut live_rx) = registry.add();
        assert_eq!(registry.len(), 2);

        drop(rx);
        registry.notify(&beacon(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(live_rx.recv().await.unwrap().round, 1);
    }

    #[tokio::test]
    async fn remove_by_id() {
        let mut registry = CallbackRegistry::new(info_span!("cb_test"));
        let (id, _rx) = registry.add();
        registry.remove(id);
        assert!(registry.is_empty());
    }
}
