//! Message envelope and service identity
//!
//! TigerStyle: Immutable-once-sent envelopes, explicit identity encoding.
//!
//! A [`ServiceId`] packs the owning worker into the high bits so routing is
//! a bit shift, never a table lookup. A [`Message`] is moved, not copied,
//! after construction; only its receiver's worker may mutate it (via
//! [`Message::redirect`] / [`Message::resend`]). Payloads are held behind
//! `Arc` so broadcast fan-out and the prefab cache can share one allocation;
//! receivers of a shared payload must treat it as read-only, which the type
//! system enforces.

use crate::buffer::Buffer;
use crate::constants::{SERVICE_SEQUENCE_MASK, WORKER_ID_SHIFT};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Message type tags
// =============================================================================

/// Unknown; invalid for sends
pub const PTYPE_UNKNOWN: u8 = 0;
/// Runtime-internal notifications and acks
pub const PTYPE_SYSTEM: u8 = 1;
/// Application payload between services
pub const PTYPE_TEXT: u8 = 2;
/// Error report tied to a session
pub const PTYPE_ERROR: u8 = 3;
/// Timer expiration, header carries the timer id
pub const PTYPE_TIMER: u8 = 4;
/// New inbound connection, payload carries the peer address
pub const PTYPE_SOCKET_ACCEPT: u8 = 5;
/// Bytes read from a connection
pub const PTYPE_SOCKET_DATA: u8 = 6;
/// Connection closed, header carries the reason
pub const PTYPE_SOCKET_CLOSE: u8 = 7;
/// Socket operation failure, header carries the reason
pub const PTYPE_SOCKET_ERROR: u8 = 8;

// =============================================================================
// ServiceId
// =============================================================================

/// Identity of a service: owning worker in the high bits, worker-local
/// sequence in the low bits
///
/// The zero id means "unset" (no sender, or broadcast origin). Socket
/// completion messages reuse the sender slot to carry the connection fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(u32);

impl ServiceId {
    /// The unset id
    pub const ZERO: ServiceId = ServiceId(0);

    /// Compose an id from a 1-based worker id and a worker-local sequence
    pub fn compose(worker_id: u32, sequence: u32) -> Self {
        debug_assert!(worker_id > 0, "worker ids are 1-based");
        debug_assert!(worker_id <= u32::MAX >> WORKER_ID_SHIFT);
        debug_assert!(sequence <= SERVICE_SEQUENCE_MASK);
        ServiceId(worker_id << WORKER_ID_SHIFT | sequence)
    }

    /// Wrap a raw u32 (inverse of [`ServiceId::as_u32`])
    pub fn from_raw(raw: u32) -> Self {
        ServiceId(raw)
    }

    /// The owning worker id (0 for the unset id)
    pub fn worker_id(self) -> u32 {
        self.0 >> WORKER_ID_SHIFT
    }

    /// The worker-local sequence
    pub fn sequence(self) -> u32 {
        self.0 & SERVICE_SEQUENCE_MASK
    }

    /// The raw id
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is the unset id
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for ServiceId {
    fn from(raw: u32) -> Self {
        ServiceId(raw)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// =============================================================================
// Message
// =============================================================================

/// The envelope routed between services
#[derive(Debug)]
pub struct Message {
    sender: ServiceId,
    receiver: ServiceId,
    session: i32,
    ptype: u8,
    header: String,
    payload: Option<Arc<Buffer>>,
    broadcast: bool,
}

impl Message {
    /// Create a message with an exclusively owned payload
    pub fn new(
        sender: ServiceId,
        receiver: ServiceId,
        session: i32,
        ptype: u8,
        header: impl Into<String>,
        payload: Option<Buffer>,
    ) -> Self {
        Self {
            sender,
            receiver,
            session,
            ptype,
            header: header.into(),
            payload: payload.map(Arc::new),
            broadcast: false,
        }
    }

    /// Create a message referencing an already shared payload (prefab or
    /// broadcast fan-out); no bytes are copied
    pub fn with_shared_payload(
        sender: ServiceId,
        receiver: ServiceId,
        session: i32,
        ptype: u8,
        header: impl Into<String>,
        payload: Arc<Buffer>,
    ) -> Self {
        Self {
            sender,
            receiver,
            session,
            ptype,
            header: header.into(),
            payload: Some(payload),
            broadcast: false,
        }
    }

    pub fn sender(&self) -> ServiceId {
        self.sender
    }

    pub fn receiver(&self) -> ServiceId {
        self.receiver
    }

    pub fn session(&self) -> i32 {
        self.session
    }

    pub fn ptype(&self) -> u8 {
        self.ptype
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    /// The payload buffer, if any
    pub fn payload(&self) -> Option<&Arc<Buffer>> {
        self.payload.as_ref()
    }

    /// Payload bytes, empty when there is no payload
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_deref().map(Buffer::data).unwrap_or(&[])
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.as_deref().map(Buffer::len).unwrap_or(0)
    }

    /// Take the payload out of the message
    pub fn take_payload(&mut self) -> Option<Arc<Buffer>> {
        self.payload.take()
    }

    /// Retarget the message in place, keeping sender and session
    ///
    /// An empty header leaves the current header untouched.
    pub fn redirect(&mut self, header: &str, receiver: ServiceId, ptype: u8) {
        if !header.is_empty() {
            self.header = header.to_string();
        }
        self.receiver = receiver;
        self.ptype = ptype;
    }

    /// Reuse the envelope as a response on behalf of `sender`
    ///
    /// The stored session becomes `-session`, marking the message as the
    /// response to that request.
    pub fn resend(
        &mut self,
        sender: ServiceId,
        receiver: ServiceId,
        header: &str,
        session: i32,
        ptype: u8,
    ) {
        debug_assert!(session != crate::constants::SESSION_RESERVED);
        if !header.is_empty() {
            self.header = header.to_string();
        }
        self.sender = sender;
        self.receiver = receiver;
        self.ptype = ptype;
        self.session = -session;
        self.broadcast = false;
    }

    /// Duplicate the envelope for one broadcast recipient, sharing the
    /// payload allocation
    pub fn broadcast_copy(&self, receiver: ServiceId) -> Message {
        Message {
            sender: self.sender,
            receiver,
            session: self.session,
            ptype: self.ptype,
            header: self.header.clone(),
            payload: self.payload.clone(),
            broadcast: true,
        }
    }

    /// Read any subset of the fields in one pass
    ///
    /// Field codes: `S` sender, `R` receiver, `E` session, `T` type,
    /// `H` header, `Z` payload bytes, `N` payload size, `B` broadcast flag.
    pub fn decode(&self, fmt: &str) -> Result<Vec<Field<'_>>> {
        let mut fields = Vec::with_capacity(fmt.len());
        for code in fmt.chars() {
            fields.push(match code {
                'S' => Field::Sender(self.sender),
                'R' => Field::Receiver(self.receiver),
                'E' => Field::Session(self.session),
                'T' => Field::Kind(self.ptype),
                'H' => Field::Header(&self.header),
                'Z' => Field::Bytes(self.bytes()),
                'N' => Field::Size(self.size()),
                'B' => Field::Broadcast(self.broadcast),
                other => return Err(Error::InvalidDecodeFormat { code: other }),
            });
        }
        Ok(fields)
    }
}

impl Clone for Message {
    /// Deep copy: header and payload bytes land in fresh allocations
    fn clone(&self) -> Self {
        Self {
            sender: self.sender,
            receiver: self.receiver,
            session: self.session,
            ptype: self.ptype,
            header: self.header.clone(),
            payload: self
                .payload
                .as_deref()
                .map(|buf| Arc::new(buf.clone())),
            broadcast: self.broadcast,
        }
    }
}

/// One decoded message field, borrowed from the message
#[derive(Debug, PartialEq, Eq)]
pub enum Field<'a> {
    Sender(ServiceId),
    Receiver(ServiceId),
    Session(i32),
    Kind(u8),
    Header(&'a str),
    Bytes(&'a [u8]),
    Size(usize),
    Broadcast(bool),
}
