//! The per-endpoint partner table (spec.md §4.1): a dense array mapping
//! `(peer_index, endpoint_index)` to an owned `Partner`, with no hashing
//! and no collisions, exactly as the reference's flat `ep->partners[]`
//! array works.

use crate::error::Status;
use crate::oracle::{BoardAddr, PeerOracle};
use crate::partner::{Partner, PartnerHandle};

/// Computes the dense slot index for `(peer_index, endpoint_index)`.
///
/// Matches `original_source/libopen-mx/omx_partner.c`'s
/// `((uint32_t) endpoint_index) + ((uint32_t) peer_index) * endpoint_max`.
fn slot_index(peer_index: u16, endpoint_index: u8, endpoint_max: u8) -> usize {
    endpoint_index as usize + peer_index as usize * endpoint_max as usize
}

pub struct PartnerTable {
    slots: Vec<Option<Partner>>,
    endpoint_max: u8,
    session_bits: u32,
}

impl PartnerTable {
    pub fn new(peer_max: u16, endpoint_max: u8, session_bits: u32) -> Self {
        let len = peer_max as usize * endpoint_max as usize;
        PartnerTable {
            slots: (0..len).map(|_| None).collect(),
            endpoint_max,
            session_bits,
        }
    }

    pub fn get(&self, handle: PartnerHandle) -> &Partner {
        self.slots[handle.0]
            .as_ref()
            .expect("dereferenced a freed partner handle")
    }

    pub fn get_mut(&mut self, handle: PartnerHandle) -> &mut Partner {
        self.slots[handle.0]
            .as_mut()
            .expect("dereferenced a freed partner handle")
    }

    fn create_at(&mut self, index: usize, board_addr: BoardAddr, endpoint_index: u8, peer_index: u16) -> PartnerHandle {
        self.slots[index] = Some(Partner::new(board_addr, endpoint_index, peer_index, self.session_bits));
        PartnerHandle(index)
    }

    /// Looks up `(peer_index, endpoint_index)`, creating the partner (via
    /// the oracle to learn its MAC address) if this is the first
    /// reference. Never returns successfully without a valid partner;
    /// fails with `Status::PeerNotFound` only if the oracle itself rejects
    /// the index.
    pub fn lookup_or_create<O: PeerOracle>(
        &mut self,
        oracle: &O,
        peer_index: u16,
        endpoint_index: u8,
    ) -> Result<PartnerHandle, Status> {
        let index = slot_index(peer_index, endpoint_index, self.endpoint_max);
        if self.slots[index].is_none() {
            let board_addr = oracle.peer_index_to_addr(peer_index)?;
            return Ok(self.create_at(index, board_addr, endpoint_index, peer_index));
        }
        Ok(PartnerHandle(index))
    }

    /// Symmetric to `lookup_or_create`, starting from a MAC address instead
    /// of a peer index. Translates MAC -> peer_index via the oracle first.
    pub fn lookup_by_addr_or_create<O: PeerOracle>(
        &mut self,
        oracle: &O,
        board_addr: BoardAddr,
        endpoint_index: u8,
    ) -> Result<PartnerHandle, Status> {
        let peer_index = oracle.peer_addr_to_index(board_addr)?;
        let index = slot_index(peer_index, endpoint_index, self.endpoint_max);
        if self.slots[index].is_none() {
            return Ok(self.create_at(index, board_addr, endpoint_index, peer_index));
        }
        Ok(PartnerHandle(index))
    }

    /// Fast receive-path lookup: the partner is asserted to already exist,
    /// because this is only called after a connect has been fully
    /// processed for this `(peer_index, endpoint_index)`. An absent slot
    /// here is a programming error (spec.md §4.1, §7 "Fatal").
    pub fn recv_lookup(&self, peer_index: u16, endpoint_index: u8) -> PartnerHandle {
        let index = slot_index(peer_index, endpoint_index, self.endpoint_max);
        assert!(
            self.slots[index].is_some(),
            "recv_lookup on ({}, {}) found no partner",
            peer_index,
            endpoint_index
        );
        PartnerHandle(index)
    }

    /// Creates (or reuses) the loopback self-partner at endpoint-open time
    /// (spec.md §4.5 `connect_myself`).
    pub fn create_myself(&mut self, board_addr: BoardAddr, endpoint_index: u8, peer_index: u16) -> PartnerHandle {
        let index = slot_index(peer_index, endpoint_index, self.endpoint_max);
        self.create_at(index, board_addr, endpoint_index, peer_index)
    }

    /// Frees a partner's slot, invalidating any handle still pointing at
    /// it. Callers must have already drained every queue referencing the
    /// partner (spec.md §4.4 step 11).
    pub fn free(&mut self, handle: PartnerHandle) {
        self.slots[handle.0] = None;
    }

    /// Iterates every live partner, for endpoint teardown only; not used on
    /// any fast path (spec.md §4.1).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PartnerHandle, &mut Partner)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|p| (PartnerHandle(i), p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeOracle {
        by_index: RefCell<HashMap<u16, BoardAddr>>,
        by_addr: RefCell<HashMap<BoardAddr, u16>>,
    }

    impl FakeOracle {
        fn new() -> Self {
            let mut by_index = HashMap::new();
            let mut by_addr = HashMap::new();
            by_index.insert(1, 0xAAu64);
            by_addr.insert(0xAAu64, 1);
            FakeOracle {
                by_index: RefCell::new(by_index),
                by_addr: RefCell::new(by_addr),
            }
        }
    }

    impl PeerOracle for FakeOracle {
        fn peer_index_to_addr(&self, peer_index: u16) -> Result<BoardAddr, Status> {
            self.by_index
                .borrow()
                .get(&peer_index)
                .copied()
                .ok_or(Status::PeerNotFound)
        }
        fn peer_addr_to_index(&self, board_addr: BoardAddr) -> Result<u16, Status> {
            self.by_addr
                .borrow()
                .get(&board_addr)
                .copied()
                .ok_or(Status::PeerNotFound)
        }
    }

    // Property 1: lookup_or_create is a function.
    #[test]
    fn lookup_or_create_is_idempotent() {
        let oracle = FakeOracle::new();
        let mut table = PartnerTable::new(16, 4, 6);
        let a = table.lookup_or_create(&oracle, 1, 0).unwrap();
        let b = table.lookup_or_create(&oracle, 1, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_peer_fails_with_peer_not_found() {
        let oracle = FakeOracle::new();
        let mut table = PartnerTable::new(16, 4, 6);
        assert_eq!(
            table.lookup_or_create(&oracle, 99, 0).unwrap_err(),
            Status::PeerNotFound
        );
    }

    #[test]
    fn lookup_by_addr_agrees_with_lookup_by_index() {
        let oracle = FakeOracle::new();
        let mut table = PartnerTable::new(16, 4, 6);
        let by_index = table.lookup_or_create(&oracle, 1, 0).unwrap();
        let by_addr = table.lookup_by_addr_or_create(&oracle, 0xAA, 0).unwrap();
        assert_eq!(by_index, by_addr);
    }

    #[test]
    #[should_panic(expected = "found no partner")]
    fn recv_lookup_on_empty_slot_panics() {
        let table = PartnerTable::new(16, 4, 6);
        table.recv_lookup(2, 0);
    }
}
