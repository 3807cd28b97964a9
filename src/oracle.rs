//! The peer directory oracle (spec.md §2 item 1): an external collaborator
//! that resolves `(peer_index ↔ MAC address)` pairs. Its own implementation
//! (hostname registries, wire discovery, a static file) is out of scope for
//! this crate; we only specify the contract the partner table depends on.

/// A 48-bit Ethernet MAC address, stored in the low 48 bits of a `u64` the
/// same way the reference keeps `board_addr` as a `uint64_t`.
pub type BoardAddr = u64;

use crate::error::Status;

/// Resolves the peer directory. Implementations back this with whatever
/// mechanism the embedding application uses (a kernel ioctl, a gossiped
/// table, a static config file); this crate treats it as an opaque oracle.
pub trait PeerOracle {
    /// Looks up the MAC address of the peer known locally by `peer_index`.
    ///
    /// Returns `Status::PeerNotFound` if the index is not registered.
    fn peer_index_to_addr(&self, peer_index: u16) -> Result<BoardAddr, Status>;

    /// Looks up the local directory index assigned to `board_addr`.
    ///
    /// Returns `Status::PeerNotFound` if the address is not registered.
    fn peer_addr_to_index(&self, board_addr: BoardAddr) -> Result<u16, Status>;
}
