//! The flat status taxonomy surfaced to applications (spec.md §6, §7).
//!
//! Open-MX does not layer errors into a hierarchy: every fallible operation
//! returns one of these variants directly, the same way the reference
//! returns a single `omx_return_t` from every API call. `Status` itself
//! implements `failure::Fail` so it can be used as the error type of a
//! `Result` without an extra wrapper, matching how lightly the reference
//! treats "soft" outcomes like a bad connection key.

use failure::Fail;

#[derive(Debug, Fail, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    #[fail(display = "success")]
    Success,
    #[fail(display = "remote endpoint rejected the connection key")]
    BadConnectionKey,
    #[fail(display = "remote endpoint unreachable")]
    RemoteEndpointUnreachable,
    #[fail(display = "endpoint closed")]
    EndpointClosed,
    #[fail(display = "bad endpoint")]
    BadEndpoint,
    #[fail(display = "no resources available")]
    NoResources,
    #[fail(display = "library not initialized")]
    NotInitialized,
    #[fail(display = "invalid parameter")]
    InvalidParameter,
    /// The peer oracle could not resolve a `(peer_index, mac)` pair.
    ///
    /// Not part of the reference's public status set (the driver hides
    /// oracle failures behind `OMX_INVALID_PARAMETER`), but kept distinct
    /// here because `PartnerTable` needs to tell its caller specifically
    /// that the oracle, not the table, rejected the lookup.
    #[fail(display = "peer not found")]
    PeerNotFound,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}
