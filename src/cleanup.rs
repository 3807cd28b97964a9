//! Partner lifecycle teardown (spec.md §4.4 "Partner cleanup"), ported from
//! `original_source/libopen-mx/omx_partner.c:omx__partner_cleanup`.
//!
//! The reference walks eight separate intrusive lists to find everything
//! that still references a partner before it can be reset or freed; we walk
//! the equivalent `VecDeque<RequestHandle>` queues instead; see
//! `request.rs` for why those replace the C linked lists.

use slab::Slab;

use crate::endpoint::Endpoint;
use crate::error::Status;
use crate::oracle::{BoardAddr, PeerOracle};
use crate::partner::PartnerHandle;
use crate::request::{Request, RequestHandle, RequestQueue};
use crate::seqnum;

/// How thoroughly `partner_cleanup` should tear down a partner (spec.md
/// §4.4; mirrors the reference's `disconnect` parameter: 0, 1, 2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CleanupMode {
    /// A new instance of this partner just showed up (session id changed
    /// under us). Drain and reset only; the partner stays addressable.
    Reset,
    /// The application asked to disconnect. Drain, reset, and scramble the
    /// receive sequence numbers so stale in-flight traffic can't collide
    /// with a future reconnection.
    Disconnect,
    /// A `Disconnect`, plus the partner's table slot itself is freed; any
    /// `PartnerHandle` still pointing at it becomes dangling and must not
    /// be dereferenced again.
    DisconnectAndFree,
}

/// Moves every `RequestHandle` in `queue` whose request belongs to
/// `partner_handle` into the returned `Vec`, leaving everything else in
/// place. Used for the endpoint-wide queues (`large_send_req_q`,
/// `queued_send_req_q`, each `unexp_req_q` slot) that hold requests for
/// every partner at once.
fn drain_matching_queue(
    requests: &Slab<Request>,
    queue: &mut RequestQueue,
    partner_handle: PartnerHandle,
) -> Vec<RequestHandle> {
    let mut matched = Vec::new();
    queue.retain(|&handle| {
        if requests[handle.0].partner == partner_handle {
            matched.push(handle);
            false
        } else {
            true
        }
    });
    matched
}

impl<O: PeerOracle> Endpoint<O> {
    /// Disconnects the partner at `(board_addr, endpoint_index)` (spec.md
    /// §8 S5, `omx_disconnect`): runs a full `DisconnectAndFree` cleanup
    /// and frees its table slot. The address the application was using to
    /// identify this partner is no longer valid afterwards.
    pub fn disconnect(&mut self, board_addr: BoardAddr, endpoint_index: u8) -> Result<(), Status> {
        let partner_handle = self
            .partners
            .lookup_by_addr_or_create(&self.oracle, board_addr, endpoint_index)?;
        self.partner_cleanup(partner_handle, CleanupMode::DisconnectAndFree);
        Ok(())
    }

    /// Tears down every piece of state this endpoint holds that references
    /// `partner_handle`, in the same order the reference does, so that no
    /// queue can still be pointing at a request (or partner) that is about
    /// to be reset or freed (spec.md §3 invariants, §4.4).
    pub fn partner_cleanup(&mut self, partner_handle: PartnerHandle, mode: CleanupMode) {
        // 1. Pending sends already handed to the partner, awaiting ack.
        let non_acked = std::mem::take(&mut self.partners.get_mut(partner_handle).non_acked_req_q);
        for handle in non_acked {
            self.complete_and_free(handle, Status::RemoteEndpointUnreachable);
        }

        // 2. Large sends whose data went out but whose notify never came
        // back.
        let large_sends = drain_matching_queue(&self.requests, &mut self.large_send_req_q, partner_handle);
        for handle in large_sends {
            let req = &mut self.requests[handle.0];
            debug_assert!(req.needs_reply);
            req.needs_reply = false;
            self.complete_and_free(handle, Status::RemoteEndpointUnreachable);
        }

        // 3. Sends still waiting on a driver resource, never submitted.
        let queued_sends = drain_matching_queue(&self.requests, &mut self.queued_send_req_q, partner_handle);
        for handle in queued_sends {
            let req = &mut self.requests[handle.0];
            req.queued = false;
            if let crate::request::RequestKind::Send(send) = &mut req.kind {
                // No sendq slot was ever allocated; make sure none gets
                // mistakenly released once this request is freed.
                send.frags_nr = 0;
            }
            self.complete_and_free(handle, Status::RemoteEndpointUnreachable);
        }

        // 4. Sends deferred on flow-control throttling to this partner.
        let throttling = std::mem::take(&mut self.partners.get_mut(partner_handle).throttling_send_req_q);
        for handle in throttling {
            let req = &mut self.requests[handle.0];
            debug_assert!(req.send_throttling);
            req.send_throttling = false;
            self.complete_and_free(handle, Status::RemoteEndpointUnreachable);
        }

        // 5. Connects still awaiting a reply from this partner instance.
        let pending_connects = std::mem::take(&mut self.partners.get_mut(partner_handle).pending_connect_req_q);
        for handle in pending_connects {
            self.connect_complete(handle, Status::RemoteEndpointUnreachable, None);
        }

        // 6. Large/medium receives only partially landed.
        let partials = std::mem::take(&mut self.partners.get_mut(partner_handle).partial_recv_req_q);
        for handle in partials {
            let ctxid = self.requests[handle.0].ctxid;
            let unexpected = match &self.requests[handle.0].kind {
                crate::request::RequestKind::RecvLarge(r) => r.recv_unexpected,
                _ => false,
            };
            let queue = if unexpected {
                &mut self.unexp_req_q[ctxid as usize]
            } else {
                &mut self.multifrag_medium_recv_req_q
            };
            if let Some(pos) = queue.iter().position(|&h| h == handle) {
                queue.remove(pos);
            }
            if let crate::request::RequestKind::RecvLarge(r) = &mut self.requests[handle.0].kind {
                r.recv_partial = false;
            }
            self.complete_and_free(handle, Status::RemoteEndpointUnreachable);
        }

        // 7. Fragments that arrived before any matching receive was
        // posted.
        self.partners.get_mut(partner_handle).early_recv_q.clear();

        // 8. Unexpected receives sitting in every ctxid's queue, unmatched
        // and undeliverable now that the partner is gone.
        for ctxid in 0..self.unexp_req_q.len() {
            let matched = drain_matching_queue(&self.requests, &mut self.unexp_req_q[ctxid], partner_handle);
            for handle in matched {
                self.free_request(handle);
            }
        }

        // 9. Reset every remaining field to its freshly-created value,
        // including membership in the endpoint-wide ack-scheduling queue
        // (data-path ack scheduling itself is out of scope here, but the
        // queue membership this partner may hold is still this endpoint's
        // to drain).
        if let Some(pos) = self.partners_to_ack.iter().position(|&h| h == partner_handle) {
            self.partners_to_ack.remove(pos);
        }
        let session_bits = self.config.session_bits;
        self.partners.get_mut(partner_handle).reset(session_bits);

        if mode == CleanupMode::Disconnect || mode == CleanupMode::DisconnectAndFree {
            // 10. Scramble the receive sequence state so a stale packet
            // from before this disconnect can't be mistaken for a fresh
            // one after reconnection.
            let partner = self.partners.get_mut(partner_handle);
            let (match_seq, frag_seq) =
                seqnum::disconnect_scramble(partner.next_match_recv_seq, partner.next_frag_recv_seq, session_bits);
            partner.next_match_recv_seq = match_seq;
            partner.next_frag_recv_seq = frag_seq;
        }

        if mode == CleanupMode::DisconnectAndFree {
            // 11. The application is done with this endpoint address;
            // drop the slot entirely.
            self.partners.free(partner_handle);
        }
    }

    /// Marks `handle` done with `status` and immediately frees its arena
    /// slot. Used for requests with no user-visible completion event of
    /// their own to post (unlike a connect, whose completion already
    /// enqueues an `Event::ConnectDone` for the caller to observe before
    /// reaping it).
    fn complete_and_free(&mut self, handle: RequestHandle, status: Status) {
        self.requests[handle.0].complete(status);
        self.free_request(handle);
    }
}
