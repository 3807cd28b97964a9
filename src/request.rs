//! The tagged-union request record (spec.md §9 "Tagged-union request
//! record") and the arena that owns them.
//!
//! Requests come in several shapes (connect, the various send modes,
//! large-message receive) but are completed, queued, and cleaned up through
//! shared generic machinery, so they share one `Request` type with a
//! `RequestKind` payload the cleanup path dispatches on.
//!
//! The reference links a request into several intrusive doubly-linked
//! lists at once (per spec.md §9, "Weak back-reference from request to
//! partner" / "Intrusive lists everywhere"). Rather than embed list nodes
//! in `Request` and deal with the unsafe pointer plumbing that implies, we
//! give every request a stable arena slot (`RequestHandle`, backed by a
//! `slab::Slab`, the same arena-of-requests approach the design notes
//! suggest) and represent every queue as a `VecDeque<RequestHandle>`. A
//! request never owns its partner; it holds a `PartnerHandle` back
//! reference, and the partner table is the sole owner of `Partner` values.

use std::collections::VecDeque;

use crate::error::Status;
use crate::partner::PartnerHandle;

/// A stable index into an endpoint's request arena. Never reused while a
/// request is alive; once freed, the slab may hand the same index to an
/// unrelated later request, so a stale handle must never be dereferenced
/// after `Endpoint::free_request`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub usize);

/// The matching context id a request completes under. Data-path matching
/// itself is out of scope for this crate; this only exists so that the
/// lifecycle manager can walk the same per-ctxid queues the reference does
/// (spec.md §4.4 step 8).
pub type CtxId = u32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendKind {
    Tiny,
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub kind: SendKind,
    /// Number of sendq fragments reserved for a `Medium` send. Cleared to
    /// zero when a queued medium send is dropped so that no sendq slot is
    /// mistakenly released (spec.md §4.4 step 3).
    pub frags_nr: u32,
}

#[derive(Debug, Clone)]
pub struct RecvLargeRequest {
    /// Set while the large-message pull is still in flight and no region
    /// has been allocated yet; cleared once the transfer completes.
    pub recv_partial: bool,
    /// Set if this receive was unmatched by a pre-posted recv and is
    /// sitting in a ctxid's `unexp_req_q` rather than
    /// `multifrag_medium_recv_req_q`.
    pub recv_unexpected: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// `endpoint.session_id` snapshotted at submission time; re-checked at
    /// completion (spec.md §4.2 step 3, Property 3).
    pub session_id: u32,
    /// The per-partner sequence number identifying this attempt among any
    /// others concurrently outstanding to the same partner.
    pub connect_seqnum: u8,
    pub resends: u32,
    pub resends_max: u32,
    pub last_send_jiffies: u64,
    /// True for a `connect()` caller (completion routes through the
    /// synchronous wait path); false for `iconnect()`.
    pub internal: bool,
    /// Set if an `iconnect` caller declined a handle; the request still
    /// runs to completion (or exhausts retries) but nobody is waiting on
    /// it.
    pub zombie: bool,
    pub match_info: u64,
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    Connect(ConnectRequest),
    Send(SendRequest),
    RecvLarge(RecvLargeRequest),
}

/// A single request arena slot.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: RequestKind,
    /// Non-owning back-reference to the partner this request is bound to.
    /// The partner table owns the `Partner`; this is never dereferenced
    /// after the partner itself has been dropped, which is why cleanup
    /// always drains every queue referencing a partner before it is freed
    /// (spec.md §3 invariants, §9).
    pub partner: PartnerHandle,
    pub ctxid: CtxId,
    /// Final status, set once and never overwritten by a second
    /// completion (spec.md §4.2 "Completion": "preserving any pre-existing
    /// error").
    pub status: Option<Status>,
    pub done: bool,
    /// Mirrors `OMX_REQUEST_STATE_NEED_REPLY`: set while this request still
    /// awaits an asynchronous completion from the peer (a connect reply, or
    /// a large-send notify). Cleared unconditionally by whatever routine
    /// completes the request.
    pub needs_reply: bool,
    /// Set for a send request currently deferred on `partners_to_ack`-style
    /// flow control (spec.md §4.4 step 4).
    pub send_throttling: bool,
    /// Set while a send sits on `queued_send_req_q` waiting for resources.
    pub queued: bool,
}

impl Request {
    pub fn new_connect(partner: PartnerHandle, ctxid: CtxId, connect: ConnectRequest) -> Self {
        Request {
            kind: RequestKind::Connect(connect),
            partner,
            ctxid,
            status: Some(Status::Success),
            done: false,
            needs_reply: true,
            send_throttling: false,
            queued: false,
        }
    }

    pub fn as_connect(&self) -> Option<&ConnectRequest> {
        match &self.kind {
            RequestKind::Connect(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_connect_mut(&mut self) -> Option<&mut ConnectRequest> {
        match &mut self.kind {
            RequestKind::Connect(c) => Some(c),
            _ => None,
        }
    }

    /// Marks this request completed, preserving an already-set error status
    /// rather than clobbering it with a later, possibly more benign, one.
    pub fn complete(&mut self, status: Status) {
        match self.status {
            Some(Status::Success) | None => self.status = Some(status),
            Some(_) => {} // an error status sticks
        }
        self.done = true;
    }
}

/// A byte buffer captured off the wire before it could be matched to a
/// waiting receive (spec.md §3 "early-arrival fragments", §4.4 step 7).
#[derive(Debug, Clone)]
pub struct EarlyPacket {
    pub data: Vec<u8>,
}

/// A FIFO queue of request handles. A thin wrapper over `VecDeque` so the
/// "dequeue from both the partner list and whatever endpoint queue it
/// belongs to" pattern in spec.md §4.4 reads the same everywhere it's used.
pub type RequestQueue = VecDeque<RequestHandle>;
