//! A software transport over raw Ethernet, built to behave the way
//! Myrinet Express NICs behave, without needing one: partner session
//! management, connect/reconnect handshaking, and the sequence-number
//! bookkeeping a reliable message-passing fabric needs underneath it.
//!
//! This crate models only that lifecycle machinery; it is sans-I/O. An
//! `Endpoint` never touches a socket, a clock, or a packet ring on its
//! own. The caller owns all of that and drives the state machine through
//! three surfaces:
//!
//! - [`endpoint::Endpoint::handle_event`] feeds in what the driver told us
//!   (a connect request or reply landed in the event ring);
//! - [`endpoint::Endpoint::poll_io`] drains what we need the driver to do
//!   in response (submit a connect packet);
//! - [`endpoint::Endpoint::poll`] drains progress events the application
//!   itself is waiting on (a connect finished).
//!
//! Data-path sends/receives, region registration, and the wire formats
//! for tiny/small/medium/large messages are an external collaborator's
//! responsibility; see the crate-level design notes for the line between
//! what is and isn't modeled here.

extern crate byteorder;
extern crate bytes;
extern crate failure;
#[macro_use]
extern crate failure_derive;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
extern crate slog_term;

mod cleanup;
mod config;
mod connect;
mod endpoint;
mod error;
mod oracle;
mod partner;
mod partner_table;
mod request;
mod seqnum;
mod wire;

pub use crate::cleanup::CleanupMode;
pub use crate::config::Config;
pub use crate::endpoint::{ConnectHeader, DriverEvent, Endpoint, Event, Io, SubmitOutcome};
pub use crate::error::Status;
pub use crate::oracle::{BoardAddr, PeerOracle};
pub use crate::partner::{Localization, Partner, PartnerHandle};
pub use crate::request::{CtxId, RequestHandle, RequestKind, SendKind};
pub use crate::wire::ConnectStatusCode;
