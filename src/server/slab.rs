//! Dense table of in-flight requests addressed by small, generation-checked tokens.
//!
//! Every request a worker is currently serving lives in one [`RequestSlot`].
//! Handlers never see a reference into the table, only a [`Token`]: an index
//! plus the generation the slot had when it was handed out. Recycling a slot
//! bumps its generation, so a stale token is detected instead of silently
//! reading the next occupant.

use crate::{
    errors::{Error, Result},
    http::types::{Method, Version},
    limits::SlabPolicy,
};
use bytes::Bytes;
use std::{cell::RefCell, fmt, io, mem, ops::Range, rc::Rc};
use tokio::sync::mpsc;

/// Opaque handle to an in-flight request.
///
/// Stays valid from the moment the request is handed to the handler until its
/// response has been fully written (or the connection is torn down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    /// Position of the slot inside the slab.
    #[inline(always)]
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// How far the request in a slot has been read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ParseState {
    #[default]
    RequestLine,
    HeadersParsed,
    BodyInProgress,
    Complete,
}

/// Where the handler gets the request body from.
#[derive(Debug, Default)]
pub(crate) enum BodySource {
    #[default]
    None,
    /// The whole body was already in the read buffer.
    Buffered(Bytes),
    /// Chunks are pushed by the connection reader as they arrive.
    Streaming(mpsc::Receiver<io::Result<Bytes>>),
    /// A consumer already took the body.
    Taken,
}

#[derive(Debug, Default)]
pub(crate) struct RequestSlot {
    generation: u32,
    occupied: bool,

    pub(crate) conn: u64,
    pub(crate) state: ParseState,

    pub(crate) method: Method,
    pub(crate) version: Version,
    /// Request line plus headers, frozen once the head is complete.
    pub(crate) head: Bytes,
    pub(crate) target: Range<usize>,
    pub(crate) headers: Vec<(Range<usize>, Range<usize>)>,

    pub(crate) has_body: bool,
    pub(crate) body: BodySource,

    pub(crate) keep_alive: bool,
    pub(crate) upgrade: bool,
    pub(crate) written: bool,
}

impl RequestSlot {
    #[inline]
    fn clear(&mut self) {
        self.occupied = false;
        self.conn = 0;
        self.state = ParseState::RequestLine;

        self.method = Method::Get;
        self.version = Version::Http11;
        self.head = Bytes::new();
        self.target = 0..0;
        self.headers.clear();

        self.has_body = false;
        self.body = BodySource::None;

        self.keep_alive = false;
        self.upgrade = false;
        self.written = false;
    }

    #[inline(always)]
    pub(crate) fn head_slice(&self, range: &Range<usize>) -> Bytes {
        self.head.slice(range.clone())
    }

    #[inline]
    pub(crate) fn take_body(&mut self) -> BodySource {
        match self.body {
            BodySource::None => BodySource::None,
            _ => mem::replace(&mut self.body, BodySource::Taken),
        }
    }
}

/// Per-worker table of in-flight requests.
#[derive(Debug)]
pub(crate) struct RequestSlab {
    entries: Vec<RequestSlot>,
    free: Vec<u32>,
    policy: SlabPolicy,
    in_use: usize,
}

impl RequestSlab {
    pub(crate) fn new(policy: SlabPolicy) -> Self {
        let initial = policy.initial();
        let mut entries = Vec::with_capacity(initial);
        entries.resize_with(initial, RequestSlot::default);

        // Lowest indices are handed out first
        let free = (0..initial as u32).rev().collect();

        Self {
            entries,
            free,
            policy,
            in_use: 0,
        }
    }

    /// Reserves a slot for a request arriving on connection `conn`.
    #[inline]
    pub(crate) fn allocate(&mut self, conn: u64) -> Result<Token> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => match self.policy {
                SlabPolicy::Fixed(capacity) => {
                    return Err(Error::ResourceExhausted { capacity })
                }
                SlabPolicy::Growable { .. } => {
                    self.entries.push(RequestSlot::default());
                    (self.entries.len() - 1) as u32
                }
            },
        };

        let slot = &mut self.entries[index as usize];
        slot.occupied = true;
        slot.conn = conn;
        self.in_use += 1;

        Ok(Token {
            index,
            generation: slot.generation,
        })
    }

    #[inline]
    pub(crate) fn get(&self, token: Token) -> Result<&RequestSlot> {
        match self.entries.get(token.index()) {
            Some(slot) if slot.occupied && slot.generation == token.generation => Ok(slot),
            _ => Err(Error::InvalidToken(token)),
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, token: Token) -> Result<&mut RequestSlot> {
        match self.entries.get_mut(token.index()) {
            Some(slot) if slot.occupied && slot.generation == token.generation => Ok(slot),
            _ => Err(Error::InvalidToken(token)),
        }
    }

    /// Clears the slot and returns it to the free list.
    ///
    /// Fails with [`Error::ResponsePending`] until the response for `token`
    /// has been marked written.
    #[inline]
    pub(crate) fn recycle(&mut self, token: Token) -> Result<()> {
        let slot = self.get_mut(token)?;
        if !slot.written {
            return Err(Error::ResponsePending(token));
        }

        self.release(token.index);
        Ok(())
    }

    /// Releases a slot whatever state its response is in. Returns `false`
    /// when the token is no longer live.
    pub(crate) fn abandon(&mut self, token: Token) -> bool {
        if self.get(token).is_err() {
            return false;
        }

        self.release(token.index);
        true
    }

    #[inline]
    fn release(&mut self, index: u32) {
        let slot = &mut self.entries[index as usize];
        slot.clear();
        slot.generation = slot.generation.wrapping_add(1);

        self.free.push(index);
        self.in_use -= 1;
    }

    /// Number of slots currently in use.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.in_use
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }
}

/// The slots one connection holds.
///
/// Allocation and recycling go through here so the connection knows its
/// live tokens; whatever is left when the connection task ends (clean close,
/// error, or abort during shutdown) is released on drop.
pub(crate) struct ConnectionGuard {
    slab: Rc<RefCell<RequestSlab>>,
    conn: u64,
    live: RefCell<Vec<Token>>,
}

impl ConnectionGuard {
    #[inline]
    pub(crate) fn new(slab: Rc<RefCell<RequestSlab>>, conn: u64) -> Self {
        Self {
            slab,
            conn,
            live: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn allocate(&self) -> Result<Token> {
        let token = self.slab.borrow_mut().allocate(self.conn)?;
        self.live.borrow_mut().push(token);
        Ok(token)
    }

    /// See [`RequestSlab::recycle`].
    #[inline]
    pub(crate) fn recycle(&self, token: Token) -> Result<()> {
        self.slab.borrow_mut().recycle(token)?;

        let mut live = self.live.borrow_mut();
        if let Some(pos) = live.iter().position(|t| *t == token) {
            live.swap_remove(pos);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.live.borrow().len()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if live.is_empty() {
            return;
        }

        if let Ok(mut slab) = self.slab.try_borrow_mut() {
            let released = live.drain(..).filter(|token| slab.abandon(*token)).count();
            if released != 0 {
                log::debug!("conn {}: released {released} abandoned request slot(s)", self.conn);
            }
        }
    }
}
