//! The endpoint: the user-visible communication handle that owns a partner
//! table and drives the cooperative single-threaded progress loop (spec.md
//! §3 "Endpoint", §5).
//!
//! Like its teacher, this is a sans-I/O state machine. It performs no
//! syscalls of its own: incoming driver events are pushed in through
//! `handle_event`, and actions the caller must perform (submitting a
//! connect packet to the driver) are drained through `poll_io`. The caller
//! owns the real file descriptor, the real mmap'd event ring, and the real
//! clock; this module only owns the protocol state those feed.

use std::collections::VecDeque;
use std::sync::Arc;

use slab::Slab;
use slog::Logger;

use crate::config::Config;
use crate::error::Status;
use crate::oracle::{BoardAddr, PeerOracle};
use crate::partner::PartnerHandle;
use crate::partner_table::PartnerTable;
use crate::request::{CtxId, Request, RequestHandle, RequestQueue};
use crate::wire::ConnectPacket;

/// An incoming event drawn from the driver's event ring (spec.md §6).
///
/// Only the connect-path event is modeled; tiny/small/medium/large
/// data-path events are an external collaborator per spec.md §1.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    RecvConnect {
        peer_index: u16,
        src_endpoint: u8,
        /// Whether the driver believes this partner is shared-memory
        /// eligible (spec.md §4.1 `check_localization`).
        shared: bool,
        /// Raw connect payload bytes, `is_reply` bit included, to be
        /// decoded by the connect protocol engine.
        data: Vec<u8>,
    },
}

/// Metadata the driver's `SEND_CONNECT` ioctl needs alongside the encoded
/// payload (spec.md §6 "Header carries...").
#[derive(Debug, Copy, Clone)]
pub struct ConnectHeader {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    /// Always 0: connects are out-of-band with respect to data sequencing
    /// (spec.md §4.2).
    pub seqnum: u16,
    pub length: u16,
    pub shared_disabled: bool,
}

/// An action the caller must perform on this endpoint's behalf.
#[derive(Debug, Clone)]
pub enum Io {
    SendConnect {
        header: ConnectHeader,
        packet: ConnectPacket,
    },
}

/// Outcome the caller reports back after attempting to execute an
/// `Io::SendConnect` (spec.md §6 "treats SEND_CONNECT as best-effort").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent,
    /// The driver had no system resources right now. Not fatal; the
    /// connect retransmitter will simply try again once `resend_delay`
    /// elapses, the same as an unacknowledged send (spec.md §4.2 step 4).
    NoResources,
}

/// User-visible progress events (spec.md §4.2 "post a user-visible progress
/// event").
#[derive(Debug, Copy, Clone)]
pub enum Event {
    ConnectDone {
        request: RequestHandle,
        partner: PartnerHandle,
        status: Status,
        /// The `(partner, session_id)` pair to remember as this
        /// connection's address, set only on `Status::Success` (spec.md
        /// §4.2 "Completion").
        session_id: Option<u32>,
    },
}

/// The user-visible communication handle bound to one NIC and one endpoint
/// index (spec.md glossary).
pub struct Endpoint<O: PeerOracle> {
    pub(crate) log: Logger,
    pub(crate) config: Arc<Config>,
    pub(crate) oracle: O,

    pub(crate) partners: PartnerTable,
    pub(crate) myself: PartnerHandle,
    pub(crate) session_id: u32,

    pub(crate) requests: Slab<Request>,

    pub(crate) connect_req_q: RequestQueue,
    pub(crate) queued_send_req_q: RequestQueue,
    pub(crate) large_send_req_q: RequestQueue,
    pub(crate) multifrag_medium_recv_req_q: RequestQueue,
    pub(crate) unexp_req_q: Vec<RequestQueue>,
    pub(crate) partners_to_ack: VecDeque<PartnerHandle>,

    pub(crate) io: VecDeque<Io>,
    pub(crate) events: VecDeque<Event>,

    pub(crate) zombies: u32,
}

impl<O: PeerOracle> Endpoint<O> {
    /// Opens an endpoint bound to `own_board_addr`/`own_endpoint_index`,
    /// drawing a fresh 32-bit session id the way the driver does at
    /// endpoint-open time, and establishing the loopback self-partner
    /// (spec.md §4.5 `connect_myself`).
    pub fn new(
        log: Logger,
        config: Arc<Config>,
        oracle: O,
        own_board_addr: BoardAddr,
        own_endpoint_index: u8,
        session_id: u32,
    ) -> Result<Self, Status> {
        let mut partners = PartnerTable::new(config.peer_max, config.endpoint_max, config.session_bits);
        let own_peer_index = oracle.peer_addr_to_index(own_board_addr)?;
        let myself = partners.create_myself(own_board_addr, own_endpoint_index, own_peer_index);

        {
            let partner = partners.get_mut(myself);
            partner.next_send_seq = 1;
            partner.next_acked_send_seq = 1;
            partner.true_session_id = Some(session_id);
            partner.back_session_id = Some(session_id);
            partner.localization = if config.self_comms_enabled || config.shared_comms_enabled {
                crate::partner::Localization::Local
            } else {
                crate::partner::Localization::Remote
            };
        }

        let ctxid_max = config.ctxid_max as usize;
        Ok(Endpoint {
            log,
            config,
            oracle,
            partners,
            myself,
            session_id,
            requests: Slab::new(),
            connect_req_q: RequestQueue::new(),
            queued_send_req_q: RequestQueue::new(),
            large_send_req_q: RequestQueue::new(),
            multifrag_medium_recv_req_q: RequestQueue::new(),
            unexp_req_q: (0..ctxid_max).map(|_| RequestQueue::new()).collect(),
            partners_to_ack: VecDeque::new(),
            io: VecDeque::new(),
            events: VecDeque::new(),
            zombies: 0,
        })
    }

    pub fn myself(&self) -> PartnerHandle {
        self.myself
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Drains one pending I/O action for the caller to execute.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.io.pop_front()
    }

    /// Drains one user-visible progress event.
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Reports the outcome of an `Io::SendConnect` the caller just
    /// attempted. `Sent` and `NoResources` are both non-fatal — the
    /// retransmitter is the only thing that needs to know, and it already
    /// stamped `last_send_jiffies` when the action was generated, so no
    /// further bookkeeping happens here either way. Any other ioctl
    /// failure is a caller-side bug, per spec.md §6 ("any other error is a
    /// programming bug and aborts"): callers should not call this method
    /// for that case and should abort on their own.
    pub fn report_send_connect(&self, outcome: SubmitOutcome) {
        if outcome == SubmitOutcome::NoResources {
            debug!(self.log, "SEND_CONNECT returned no resources, will retry");
        }
    }

    /// Feeds one event drawn from the driver's event ring into the
    /// protocol engine.
    pub fn handle_event(&mut self, now: u64, event: DriverEvent) {
        match event {
            DriverEvent::RecvConnect {
                peer_index,
                src_endpoint,
                shared,
                data,
            } => self.handle_recv_connect(now, peer_index, src_endpoint, shared, &data),
        }
    }

    fn handle_recv_connect(
        &mut self,
        now: u64,
        peer_index: u16,
        src_endpoint: u8,
        shared: bool,
        data: &[u8],
    ) {
        let packet = match ConnectPacket::decode(data) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!(self.log, "dropping connect reply with malformed status code");
                return;
            }
            Err(e) => {
                debug!(self.log, "dropping malformed connect packet"; "reason" => format!("{}", e));
                return;
            }
        };
        match packet {
            ConnectPacket::Request(req) => {
                self.process_recv_connect_request(peer_index, src_endpoint, shared, req)
            }
            ConnectPacket::Reply(reply) => {
                self.process_recv_connect_reply(now, peer_index, src_endpoint, shared, reply)
            }
        }
    }

    pub(crate) fn alloc_request(&mut self, request: Request) -> RequestHandle {
        RequestHandle(self.requests.insert(request))
    }

    pub(crate) fn free_request(&mut self, handle: RequestHandle) {
        self.requests.remove(handle.0);
    }

    pub(crate) fn ctxid_from_match_info(&self, match_info: u64) -> CtxId {
        if self.config.ctxid_max <= 1 {
            0
        } else {
            (match_info % u64::from(self.config.ctxid_max)) as CtxId
        }
    }
}

pub use crate::wire::ConnectStatusCode;
