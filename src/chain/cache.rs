use super::Beacon;
use crate::key::Scheme;
use crate::protobuf::randchain::PartialPacket;

use energon::kyber::tbls::SigShare;

/// Partials are accepted up to this amount of rounds ahead of the active
/// round, which makes recovery after a short gap quick.
pub const FUTURE_ROUNDS: u64 = 3;

/// Outcome of adding a verified share.
#[derive(Debug, PartialEq, Eq)]
pub enum AddShare {
    /// Stored; carries the new count for the round.
    Added(usize),
    /// A share with this signer index is already present for the round.
    DuplicateIndex,
    /// The round already holds `threshold` shares, recovery is possible
    /// and extra partials are discarded.
    Saturated,
}

#[derive(Debug)]
struct RoundShares<S: Scheme> {
    round: u64,
    shares: Vec<SigShare<S>>,
}

#[derive(Debug)]
struct RoundPackets {
    round: u64,
    packets: Vec<PartialPacket>,
}

/// Two-tier buffer of partial signatures.
///
/// Verified [`SigShare`]s are collected per round for rounds extending
/// the current chain head. Packets that cannot be verified yet (their
/// round is in the future, or their `previous_*` does not match the head
/// at arrival time) are buffered raw and promoted once the head or the
/// round clock makes them checkable.
///
/// Because failed rounds are skipped rather than back-filled, several
/// distinct rounds may legitimately reference the same head; each keeps
/// its own share set.
///
/// The cache is volatile and rebuilt from live traffic after a restart.
#[derive(Debug)]
pub struct PartialCache<S: Scheme> {
    threshold: usize,
    last_stored: u64,
    current_round: u64,
    verified: Vec<RoundShares<S>>,
    buffered: Vec<RoundPackets>,
}

impl<S: Scheme> PartialCache<S> {
    pub fn new(last_stored: u64, current_round: u64, threshold: usize) -> Self {
        Self {
            threshold,
            last_stored,
            current_round,
            verified: vec![],
            buffered: vec![],
        }
    }

    /// Rounds a packet may target: anything newer than the head, up to
    /// [`FUTURE_ROUNDS`] ahead of the clock.
    pub fn is_round_allowed(&self, round: u64) -> bool {
        round > self.last_stored && round <= self.current_round + FUTURE_ROUNDS
    }

    /// Updates the active round from the ticker and evicts entries that
    /// fell out of the window.
    pub fn new_round(&mut self, round: u64) {
        self.current_round = round;
        self.evict();
    }

    /// Registers a new chain head: share sets for rounds at or below it
    /// are obsolete, and the remaining verified sets referenced the old
    /// head, so the whole tier is dropped. Buffered packets stay until
    /// [`PartialCache::promote`] re-checks them.
    pub fn advance_head(&mut self, head_round: u64) {
        self.last_stored = head_round;
        self.verified.clear();
        self.evict();
    }

    /// Removes and returns buffered packets that became checkable: their
    /// round is due (at most one ahead of the clock) and their
    /// `previous_*` matches `head`.
    pub fn promote(&mut self, head: &Beacon) -> Vec<PartialPacket> {
        let current = self.current_round;
        let mut due = vec![];

        for slot in &mut self.buffered {
            if slot.round > self.last_stored && slot.round <= current + 1 {
                let (matching, keep): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut slot.packets).into_iter().partition(|p| {
                        p.previous_round == head.round && p.previous_sig == head.signature
                    });
                slot.packets = keep;
                due.extend(matching);
            }
        }
        self.buffered.retain(|slot| !slot.packets.is_empty());

        due
    }

    pub fn is_index_present(&self, round: u64, index: u32) -> bool {
        self.verified
            .iter()
            .find(|r| r.round == round)
            .is_some_and(|r| r.shares.iter().any(|s| s.index() == index))
    }

    /// Adds a verified share for `round`.
    ///
    /// WARNING: BLS validity, head linkage and round value must be
    /// prechecked by the caller.
    pub fn add(&mut self, round: u64, share: SigShare<S>) -> AddShare {
        let slot = match self.verified.iter_mut().find(|r| r.round == round) {
            Some(slot) => slot,
            None => {
                self.verified.push(RoundShares {
                    round,
                    shares: Vec::with_capacity(self.threshold),
                });
                self.verified.last_mut().expect("just pushed")
            }
        };

        if slot.shares.len() >= self.threshold {
            return AddShare::Saturated;
        }
        if slot.shares.iter().any(|s| s.index() == share.index()) {
            return AddShare::DuplicateIndex;
        }
        slot.shares.push(share);

        AddShare::Added(slot.shares.len())
    }

    /// Number of verified shares held for `round`.
    pub fn count(&self, round: u64) -> usize {
        self.verified
            .iter()
            .find(|r| r.round == round)
            .map_or(0, |r| r.shares.len())
    }

    /// Atomic snapshot-and-remove of the round's shares, sorted by signer
    /// index as the recovery routine expects.
    pub fn drain(&mut self, round: u64) -> Option<Vec<SigShare<S>>> {
        let pos = self.verified.iter().position(|r| r.round == round)?;
        let mut shares = self.verified.swap_remove(pos).shares;
        if shares.is_empty() {
            return None;
        }
        shares.sort_by_key(SigShare::index);

        Some(shares)
    }

    /// Buffers an unverified packet.
    ///
    /// Returns `None` if the round is outside the allowed window,
    /// `Some(false)` for a duplicate or saturated slot, `Some(true)` when
    /// stored.
    pub fn buffer(&mut self, packet: PartialPacket) -> Option<bool> {
        if !self.is_round_allowed(packet.round) {
            return None;
        }
        let slot = match self.buffered.iter_mut().find(|r| r.round == packet.round) {
            Some(slot) => slot,
            None => {
                self.buffered.push(RoundPackets {
                    round: packet.round,
                    packets: Vec::with_capacity(self.threshold),
                });
                self.buffered.last_mut().expect("just pushed")
            }
        };

        if slot.packets.len() >= self.threshold
            || slot.packets.iter().any(|p| p.partial_sig == packet.partial_sig)
        {
            return Some(false);
        }
        slot.packets.push(packet);

        Some(true)
    }

    fn evict(&mut self) {
        let floor = self.current_round.saturating_sub(FUTURE_ROUNDS);
        self.verified
            .retain(|r| r.round > self.last_stored && r.round >= floor);
        self.buffered
            .retain(|r| r.round > self.last_stored && r.round >= floor);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use energon::drand::schemes::DefaultScheme;

    fn packet(round: u64, prev_round: u64, prev_sig: &[u8], tag: u8) -> PartialPacket {
        PartialPacket {
            round,
            previous_round: prev_round,
            previous_sig: prev_sig.to_vec(),
            partial_sig: vec![tag, tag],
        }
    }

    fn head(round: u64, sig: &[u8]) -> Beacon {
        Beacon {
            round,
            previous_round: round.saturating_sub(1),
            previous_sig: vec![],
            signature: sig.to_vec(),
        }
    }

    #[test]
    fn window_tracks_clock_and_head() {
        let mut cache = PartialCache::<DefaultScheme>::new(0, 1, 2);
        assert!(cache.is_round_allowed(1));
        assert!(cache.is_round_allowed(4));
        assert!(!cache.is_round_allowed(0));
        assert!(!cache.is_round_allowed(5));

        cache.new_round(10);
        assert!(cache.is_round_allowed(13));
        assert!(!cache.is_round_allowed(14));

        cache.advance_head(9);
        assert!(!cache.is_round_allowed(9));
        assert!(cache.is_round_allowed(10));
    }

    #[test]
    fn buffer_rejects_duplicates_and_saturation() {
        let mut cache = PartialCache::<DefaultScheme>::new(0, 1, 2);

        assert_eq!(cache.buffer(packet(2, 1, b"h1", 1)), Some(true));
        assert_eq!(cache.buffer(packet(2, 1, b"h1", 1)), Some(false));
        assert_eq!(cache.buffer(packet(2, 1, b"h1", 2)), Some(true));
        // Saturated: recovery material already buffered.
        assert_eq!(cache.buffer(packet(2, 1, b"h1", 3)), Some(false));
        // Outside the window.
        assert!(cache.buffer(packet(9, 8, b"h8", 4)).is_none());
    }

    #[test]
    fn promote_returns_matching_packets_once_due() {
        let mut cache = PartialCache::<DefaultScheme>::new(0, 1, 3);
        let h1 = head(1, b"sig1");

        // Round 2 packets: one extends head 1, one equivocates.
        cache.buffer(packet(2, 1, b"sig1", 1));
        cache.buffer(packet(2, 1, b"forged", 2));
        // Round 4 is too far in the future to be due at round 2.
        cache.buffer(packet(4, 3, b"sig3", 3));

        cache.advance_head(1);
        cache.new_round(2);
        let due = cache.promote(&h1);
        assert_eq!(due, vec![packet(2, 1, b"sig1", 1)]);

        // Round 4 becomes due once the head reaches round 3; the
        // equivocating round-2 packet is evicted with its round.
        cache.advance_head(3);
        cache.new_round(4);
        assert_eq!(cache.promote(&head(3, b"sig3")), vec![packet(4, 3, b"sig3", 3)]);
        assert!(cache.buffered.is_empty());
    }

    #[test]
    fn advance_head_clears_verified_tier() {
        let mut cache = PartialCache::<DefaultScheme>::new(0, 1, 2);
        // No real shares are needed to check the bookkeeping of counts.
        assert_eq!(cache.count(1), 0);
        cache.advance_head(1);
        assert_eq!(cache.count(1), 0);
        assert!(cache.drain(1).is_none());
    }
}
