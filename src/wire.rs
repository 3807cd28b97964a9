//! Connect packet wire layout (spec.md §6), network byte order.
//!
//! Both directions of the connect handshake share one physical packet type
//! discriminated by the `is_reply` bit in byte 0 of the payload union. We
//! model that as a Rust enum instead, decoding the bit only once at the
//! boundary (`ConnectPacket::decode`).

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use failure::Fail;

/// `connect_status_code` as carried in a connect reply. Any wire value
/// outside this set is per spec.md §4.2/§9 silently ignored by the
/// receiver (logged at `debug!`, never surfaced as an error).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectStatusCode {
    Success,
    BadKey,
}

impl ConnectStatusCode {
    fn to_wire(self) -> u8 {
        match self {
            ConnectStatusCode::Success => 0,
            ConnectStatusCode::BadKey => 1,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ConnectStatusCode::Success),
            1 => Some(ConnectStatusCode::BadKey),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectRequestData {
    pub src_session_id: u32,
    pub app_key: u32,
    pub connect_seqnum: u8,
    pub target_recv_seqnum_start: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectReplyData {
    pub src_session_id: u32,
    pub target_session_id: u32,
    pub connect_seqnum: u8,
    pub target_recv_seqnum_start: u16,
    pub connect_status_code: ConnectStatusCode,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectPacket {
    Request(ConnectRequestData),
    Reply(ConnectReplyData),
}

/// Length in bytes of an encoded request payload.
pub const REQUEST_LEN: usize = 4 + 4 + 1 + 1 + 2;
/// Length in bytes of an encoded reply payload.
pub const REPLY_LEN: usize = 4 + 4 + 1 + 1 + 2 + 1;

#[derive(Debug, Fail, Copy, Clone, PartialEq, Eq)]
pub enum WireError {
    #[fail(display = "connect packet too short: {} bytes", _0)]
    TooShort(usize),
}

impl ConnectRequestData {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REQUEST_LEN);
        buf.put_u32_be(self.src_session_id);
        buf.put_u32_be(self.app_key);
        buf.put_u8(0); // is_reply = 0
        buf.put_u8(self.connect_seqnum);
        buf.put_u16_be(self.target_recv_seqnum_start);
    }

    fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < REQUEST_LEN {
            return Err(WireError::TooShort(data.len()));
        }
        Ok(ConnectRequestData {
            src_session_id: BigEndian::read_u32(&data[0..4]),
            app_key: BigEndian::read_u32(&data[4..8]),
            connect_seqnum: data[9],
            target_recv_seqnum_start: BigEndian::read_u16(&data[10..12]),
        })
    }
}

impl ConnectReplyData {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REPLY_LEN);
        buf.put_u32_be(self.src_session_id);
        buf.put_u32_be(self.target_session_id);
        buf.put_u8(1); // is_reply = 1
        buf.put_u8(self.connect_seqnum);
        buf.put_u16_be(self.target_recv_seqnum_start);
        buf.put_u8(self.connect_status_code.to_wire());
    }

    fn decode(data: &[u8]) -> Result<Option<Self>, WireError> {
        if data.len() < REPLY_LEN {
            return Err(WireError::TooShort(data.len()));
        }
        let code = match ConnectStatusCode::from_wire(data[12]) {
            Some(code) => code,
            // Malformed connect_status_code: the reference silently drops
            // the reply (spec.md §4.2, §9 Open Question). We surface that
            // as `Ok(None)` rather than an error so the caller can log and
            // move on without treating it as a wire corruption.
            None => return Ok(None),
        };
        Ok(Some(ConnectReplyData {
            src_session_id: BigEndian::read_u32(&data[0..4]),
            target_session_id: BigEndian::read_u32(&data[4..8]),
            connect_seqnum: data[9],
            target_recv_seqnum_start: BigEndian::read_u16(&data[10..12]),
            connect_status_code: code,
        }))
    }
}

impl ConnectPacket {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            ConnectPacket::Request(req) => req.encode(&mut buf),
            ConnectPacket::Reply(reply) => reply.encode(&mut buf),
        }
        buf
    }

    /// Decodes a connect payload, dispatching on the `is_reply` bit at byte
    /// index 8 (immediately after the two session id fields, which both
    /// variants share at the same offset).
    ///
    /// Returns `Ok(None)` for a reply carrying an unrecognized status code,
    /// which callers must treat as "drop silently", not as a decode error.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, WireError> {
        if data.len() < 9 {
            return Err(WireError::TooShort(data.len()));
        }
        if data[8] == 0 {
            ConnectRequestData::decode(data).map(|req| Some(ConnectPacket::Request(req)))
        } else {
            ConnectReplyData::decode(data)
                .map(|reply| reply.map(ConnectPacket::Reply))
        }
    }
}
