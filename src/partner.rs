//! The `Partner` record (spec.md §3) and the intrusive-list membership it
//! keeps as indexed queues into the owning endpoint's request arena.

use std::collections::VecDeque;

use crate::oracle::BoardAddr;
use crate::request::{EarlyPacket, RequestQueue};

/// A stable index into an endpoint's dense partner table. Computed
/// directly from `(peer_index, endpoint_index)`; see
/// `partner_table::slot_index`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PartnerHandle(pub usize);

/// Whether a partner is reachable over the loopback/shared-memory fast path
/// or must go through the network, and whether that has even been
/// determined yet (spec.md §3, §4.1 `check_localization`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Localization {
    Unknown,
    Local,
    Remote,
}

/// Whether, and how, this partner owes the remote an acknowledgement.
/// Membership in the endpoint's `partners_to_ack` queue is tracked
/// separately via `Partner::in_partners_to_ack` so resets can remove a
/// partner from that queue idempotently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NeedAck {
    NoAck,
    Needed,
}

/// The remote peer of this endpoint, identified by `(peer_index,
/// endpoint_index)`. Owned uniquely by the partner table; every other
/// reference to a partner (a request, a queue entry) is a non-owning
/// `PartnerHandle` back-reference (spec.md §3 invariants).
#[derive(Debug, Clone)]
pub struct Partner {
    pub board_addr: BoardAddr,
    pub endpoint_index: u8,
    pub peer_index: u16,
    pub localization: Localization,

    /// The session id the remote reported in its connect *reply* to us.
    /// `None` until our first successful reply from this partner instance.
    pub true_session_id: Option<u32>,
    /// The session id the remote reported in its connect *request* to us.
    /// `None` until we first receive a connect request from this partner
    /// instance. `true_session_id.is_some()` implies
    /// `back_session_id == true_session_id` (spec.md §3 invariants).
    pub back_session_id: Option<u32>,

    pub next_send_seq: u16,
    pub next_acked_send_seq: u16,
    pub next_match_recv_seq: u16,
    pub next_frag_recv_seq: u16,
    pub last_acked_recv_seq: u16,

    /// Monotonically incremented for every connect we originate to this
    /// partner, so concurrently outstanding attempts can be told apart
    /// (spec.md §4.2, Property 3).
    pub connect_seqnum: u8,
    pub last_send_acknum: u8,
    pub last_recv_acknum: u8,

    pub need_ack: NeedAck,
    pub in_partners_to_ack: bool,
    pub throttling_sends_nr: u32,

    /// Opaque application token set via `set_user_context`. Not
    /// interpreted by this crate.
    pub user_context: u64,

    pub non_acked_req_q: RequestQueue,
    pub pending_connect_req_q: RequestQueue,
    pub partial_recv_req_q: RequestQueue,
    pub early_recv_q: VecDeque<EarlyPacket>,
    pub throttling_send_req_q: RequestQueue,
}

impl Partner {
    /// Creates a partner in its freshly-allocated state (spec.md §4.1
    /// `lookup_or_create`/`lookup_by_addr_or_create`, and
    /// `original_source/libopen-mx/omx_partner.c:omx__partner_create`).
    pub fn new(board_addr: BoardAddr, endpoint_index: u8, peer_index: u16, session_bits: u32) -> Self {
        let mut partner = Partner {
            board_addr,
            endpoint_index,
            peer_index,
            localization: Localization::Unknown,
            true_session_id: None,
            back_session_id: None,
            next_send_seq: 0,
            next_acked_send_seq: 0,
            next_match_recv_seq: 0,
            next_frag_recv_seq: 0,
            last_acked_recv_seq: 0,
            connect_seqnum: 0,
            last_send_acknum: 0,
            last_recv_acknum: 0,
            need_ack: NeedAck::NoAck,
            in_partners_to_ack: false,
            throttling_sends_nr: 0,
            user_context: 0,
            non_acked_req_q: VecDeque::new(),
            pending_connect_req_q: VecDeque::new(),
            partial_recv_req_q: VecDeque::new(),
            early_recv_q: VecDeque::new(),
            throttling_send_req_q: VecDeque::new(),
        };
        partner.reset(session_bits);
        partner
    }

    /// Clears every intrusive queue head and zeroes ack/connect/session
    /// state (spec.md §4.4 step 9, `omx__partner_reset`).
    ///
    /// Applying this twice in a row yields the same state as applying it
    /// once (spec.md §8 Property 6): every field it touches is set to a
    /// fixed value, not incremented or toggled relative to its prior value.
    pub fn reset(&mut self, session_bits: u32) {
        self.non_acked_req_q.clear();
        self.pending_connect_req_q.clear();
        self.partial_recv_req_q.clear();
        self.early_recv_q.clear();
        self.throttling_send_req_q.clear();

        self.true_session_id = None;
        self.back_session_id = None;
        self.next_send_seq = 0;
        self.next_acked_send_seq = 0;
        self.next_match_recv_seq = crate::seqnum::reset(self.next_match_recv_seq, session_bits);
        self.next_frag_recv_seq = self.next_match_recv_seq;
        self.last_acked_recv_seq = self.next_frag_recv_seq;
        self.connect_seqnum = 0;
        self.last_send_acknum = 0;
        self.last_recv_acknum = 0;
        self.throttling_sends_nr = 0;

        self.need_ack = NeedAck::NoAck;
        self.in_partners_to_ack = false;
    }

    /// The first time `localization` is learned, sets it from the driver's
    /// shared-memory-eligibility flag; on every later call asserts that the
    /// driver hasn't changed its mind, since a partner's physical locality
    /// cannot change after creation (spec.md §4.1).
    pub fn check_localization(&mut self, shared_from_driver: bool, shared_allowed: bool) {
        let localization = if shared_from_driver && shared_allowed {
            Localization::Local
        } else {
            Localization::Remote
        };
        match self.localization {
            Localization::Unknown => self.localization = localization,
            current => debug_assert_eq!(
                current, localization,
                "partner {:?}/{} localization changed after being learned",
                self.board_addr, self.endpoint_index
            ),
        }
    }
}
