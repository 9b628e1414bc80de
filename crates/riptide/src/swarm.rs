use std::collections::HashMap;
use tracing::debug;

use crate::bitset::Bitset;
use crate::piece_frequency::PieceFrequency;

/// Swarm-wide piece accounting: the local bitfield, every registered peer's
/// bitfield, and a replication-count structure answering rarest-first
/// queries in O(1).
///
/// All updates for one peer are issued by that peer's reader task, so they
/// arrive here totally ordered; the session serializes cross-peer access.
#[derive(Debug)]
pub struct BitfieldManager {
    local: Bitset,
    /// `None` until the peer's first bitfield or `have` arrives.
    peers: HashMap<String, Option<Bitset>>,
    frequency: PieceFrequency,
    num_pieces: usize,
}

impl BitfieldManager {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            local: Bitset::new(num_pieces),
            peers: HashMap::new(),
            frequency: PieceFrequency::new(),
            num_pieces,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn local(&self) -> &Bitset {
        &self.local
    }

    /// Wire form of the local bitfield, for the registration-time message.
    pub fn local_bytes(&self) -> Vec<u8> {
        self.local.to_bytes()
    }

    /// Records a locally completed and verified piece.
    pub fn mark_local_piece(&mut self, index: usize) {
        self.local.set(index);
    }

    /// Registers a peer that has not sent a bitfield yet.
    pub fn add_peer(&mut self, peer: &str) {
        debug!(peer, "registering peer without bitfield");
        self.peers.entry(peer.to_string()).or_insert(None);
    }

    /// Installs or replaces a peer's bitfield, keeping replication counts
    /// consistent via the diff of old and new.
    pub fn add_bitfield(&mut self, peer: &str, bitfield: Bitset) {
        debug_assert_eq!(bitfield.len(), self.num_pieces);
        let old = self.peers.get(peer).and_then(|slot| slot.clone());
        if let Some(old) = old {
            self.remove_from_frequency(&old);
        }
        self.add_to_frequency(&bitfield);
        self.peers.insert(peer.to_string(), Some(bitfield));
    }

    /// Applies a `have`: sets one bit in the peer's bitfield. Peers that
    /// skipped the bitfield message start from an empty one.
    pub fn add_piece(&mut self, peer: &str, index: usize) {
        let num_pieces = self.num_pieces;
        let slot = self
            .peers
            .entry(peer.to_string())
            .or_insert(None)
            .get_or_insert_with(|| Bitset::new(num_pieces));
        if !slot.get(index) {
            slot.set(index);
            self.frequency.inc(index);
        }
    }

    /// Unregisters a peer, decrementing the count of every piece it had.
    pub fn remove_peer(&mut self, peer: &str) {
        if let Some(bitfield) = self.peers.remove(peer).flatten() {
            self.remove_from_frequency(&bitfield);
        }
    }

    pub fn contains_peer(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_bitfield(&self, peer: &str) -> Option<&Bitset> {
        self.peers.get(peer).and_then(|b| b.as_ref())
    }

    /// Whether the peer has at least one piece we lack.
    pub fn am_interested(&self, peer: &str) -> bool {
        match self.peer_bitfield(peer) {
            Some(bits) => bits.and_not(&self.local).any_set(),
            None => false,
        }
    }

    /// The pieces this peer has and we lack.
    pub fn interesting_pieces(&self, peer: &str) -> Option<Bitset> {
        self.peer_bitfield(peer)
            .map(|bits| bits.and_not(&self.local))
    }

    /// Any piece with the smallest positive replication count.
    pub fn rarest_piece(&self) -> Option<usize> {
        self.frequency.rarest()
    }

    pub fn most_common_piece(&self) -> Option<usize> {
        self.frequency.most_common()
    }

    /// Replication count of one piece across registered peers.
    pub fn piece_frequency(&self, index: usize) -> usize {
        self.frequency.count(index)
    }

    fn add_to_frequency(&mut self, bitfield: &Bitset) {
        for index in bitfield.ones() {
            self.frequency.inc(index);
        }
    }

    fn remove_from_frequency(&mut self, bitfield: &Bitset) {
        for index in bitfield.ones() {
            self.frequency.dec(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(pattern: &str) -> Bitset {
        let mut bitset = Bitset::new(pattern.len());
        for (i, c) in pattern.chars().enumerate() {
            if c == '1' {
                bitset.set(i);
            }
        }
        bitset
    }

    #[test]
    fn frequency_matches_registered_bitfields() {
        let mut manager = BitfieldManager::new(3);
        manager.add_bitfield("p1", bits("110"));
        manager.add_bitfield("p2", bits("101"));
        manager.add_bitfield("p3", bits("010"));

        assert_eq!(manager.piece_frequency(0), 2);
        assert_eq!(manager.piece_frequency(1), 2);
        assert_eq!(manager.piece_frequency(2), 1);
        assert_eq!(manager.rarest_piece(), Some(2));
    }

    #[test]
    fn remove_peer_updates_rarest() {
        let mut manager = BitfieldManager::new(3);
        manager.add_bitfield("p1", bits("110"));
        manager.add_bitfield("p2", bits("101"));
        manager.add_bitfield("p3", bits("010"));
        manager.remove_peer("p3");

        assert_eq!(manager.piece_frequency(0), 2);
        assert_eq!(manager.piece_frequency(1), 1);
        assert_eq!(manager.piece_frequency(2), 1);
        // Both remaining singletons are acceptable rarest answers.
        let rarest = manager.rarest_piece().unwrap();
        assert!(rarest == 1 || rarest == 2);
        assert_eq!(manager.piece_frequency(rarest), 1);
    }

    #[test]
    fn removed_peers_pieces_are_forgotten() {
        let mut manager = BitfieldManager::new(4);
        manager.add_bitfield("p1", bits("0001"));
        assert_eq!(manager.rarest_piece(), Some(3));
        manager.remove_peer("p1");
        assert_eq!(manager.rarest_piece(), None);
    }

    #[test]
    fn replacing_a_bitfield_diffs_the_counts() {
        let mut manager = BitfieldManager::new(3);
        manager.add_bitfield("p1", bits("110"));
        manager.add_bitfield("p1", bits("011"));
        assert_eq!(manager.piece_frequency(0), 0);
        assert_eq!(manager.piece_frequency(1), 1);
        assert_eq!(manager.piece_frequency(2), 1);
    }

    #[test]
    fn have_before_bitfield_starts_from_empty() {
        let mut manager = BitfieldManager::new(8);
        manager.add_peer("p1");
        assert!(manager.peer_bitfield("p1").is_none());
        manager.add_piece("p1", 5);
        assert_eq!(manager.piece_frequency(5), 1);
        assert!(manager.peer_bitfield("p1").unwrap().get(5));

        // A repeated have must not double-count.
        manager.add_piece("p1", 5);
        assert_eq!(manager.piece_frequency(5), 1);
    }

    #[test]
    fn interest_follows_local_progress() {
        let mut manager = BitfieldManager::new(3);
        manager.add_peer("p1");
        assert!(!manager.am_interested("p1"));

        manager.add_bitfield("p1", bits("101"));
        assert!(manager.am_interested("p1"));

        manager.mark_local_piece(0);
        assert!(manager.am_interested("p1"));
        manager.mark_local_piece(2);
        assert!(!manager.am_interested("p1"));
    }

    #[test]
    fn interesting_pieces_is_the_and_not_view() {
        let mut manager = BitfieldManager::new(4);
        manager.add_bitfield("p1", bits("1101"));
        manager.mark_local_piece(0);
        let interesting = manager.interesting_pieces("p1").unwrap();
        assert_eq!(interesting.ones().collect::<Vec<_>>(), vec![1, 3]);
    }
}
