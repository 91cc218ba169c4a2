//! Mesh envelope — framing, parsing and route bookkeeping.
//!
//! An envelope travels as one multi-frame message:
//!
//! ```text
//! [route_1 .. route_n, EMPTY, msg_1 .. msg_m, EMPTY, ret_1 .. ret_k, META]
//! ```
//!
//! `EMPTY` is a zero-length frame separating the sections and `META` is one
//! flags byte followed by the UTF-8 message type. Because empty frames are
//! separators, neither payload frames nor identities may be empty.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MeshError;

/// Every hop prepends itself to the return route; broadcast semantics apply.
pub const TRACK_ROUTE: u8 = 1;

/// A routed mesh message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: String,
    messages: Vec<Bytes>,
    route: Vec<String>,
    return_route: Vec<String>,
    flags: u8,
}

impl Envelope {
    /// Create an envelope with no route (local delivery) and no flags.
    ///
    /// Empty payload entries are dropped. Fails when `message_type` is empty.
    pub fn new<M, B>(message_type: impl Into<String>, messages: M) -> Result<Self, MeshError>
    where
        M: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(MeshError::InvalidEnvelope("message type is required".into()));
        }

        Ok(Self {
            message_type,
            messages: messages
                .into_iter()
                .map(Into::into)
                .filter(|m: &Bytes| !m.is_empty())
                .collect(),
            route: Vec::new(),
            return_route: Vec::new(),
            flags: 0,
        })
    }

    /// Replace the route. Empty identities are dropped.
    pub fn with_route<I, S>(mut self, route: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route = normalize_route(route);
        self
    }

    /// Replace the return route. Empty identities are dropped.
    pub fn with_return_route<I, S>(mut self, return_route: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.return_route = normalize_route(return_route);
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// A copy of this envelope addressed along a different route.
    pub fn readdressed(&self, route: Vec<String>) -> Self {
        Self {
            route,
            ..self.clone()
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn messages(&self) -> &[Bytes] {
        &self.messages
    }

    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn return_route(&self) -> &[String] {
        &self.return_route
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_flagged(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    // -- Route bookkeeping ---------------------------------------------------

    /// With an identity, pop it from the front of the route for as long as it
    /// matches. Without one, clear the whole route. Returns whether anything
    /// was removed.
    pub fn consume_route(&mut self, identity: Option<&str>) -> bool {
        match identity {
            Some(identity) => {
                let n = self.route.iter().take_while(|hop| *hop == identity).count();
                self.route.drain(..n);
                n > 0
            }
            None => {
                let had_route = !self.route.is_empty();
                self.route.clear();
                had_route
            }
        }
    }

    pub fn route_remains(&self) -> bool {
        !self.route.is_empty()
    }

    /// Prepend hops to the route.
    pub fn inject_route<S: AsRef<str>>(&mut self, prefix: &[S]) {
        self.route.splice(0..0, prefix.iter().map(|s| s.as_ref().to_string()));
    }

    /// Prepend a hop to the return route.
    pub fn inject_sender(&mut self, identity: &str) {
        self.return_route.insert(0, identity.to_string());
    }

    // -- Wire codec ----------------------------------------------------------

    /// Serialize to the wire frame sequence.
    pub fn to_frames(&self) -> Vec<Bytes> {
        let mut frames =
            Vec::with_capacity(self.route.len() + self.messages.len() + self.return_route.len() + 3);

        frames.extend(self.route.iter().map(|hop| Bytes::from(hop.clone())));
        frames.push(Bytes::new());
        frames.extend(self.messages.iter().cloned());
        frames.push(Bytes::new());
        frames.extend(self.return_route.iter().map(|hop| Bytes::from(hop.clone())));

        let mut meta = BytesMut::with_capacity(1 + self.message_type.len());
        meta.put_u8(self.flags);
        meta.put_slice(self.message_type.as_bytes());
        frames.push(meta.freeze());

        frames
    }

    /// Parse a wire frame sequence.
    ///
    /// `sender` is the identity the transport saw physically deliver the
    /// frames. When route tracking is on and no return route was carried, it
    /// becomes the first return-route hop.
    pub fn from_frames<I>(frames: I, sender: Option<&str>) -> Result<Self, MeshError>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut frames: Vec<Bytes> = frames.into_iter().collect();
        let meta = frames
            .pop()
            .ok_or_else(|| MeshError::Malformed("empty frame sequence".into()))?;
        if meta.is_empty() {
            return Err(MeshError::Malformed("missing metadata frame".into()));
        }

        let flags = meta[0];
        let message_type = std::str::from_utf8(&meta[1..])
            .map_err(|_| MeshError::Malformed("message type is not UTF-8".into()))?
            .to_string();
        if message_type.is_empty() {
            return Err(MeshError::Malformed("message type is empty".into()));
        }

        let mut section = 0;
        let mut route = Vec::new();
        let mut messages = Vec::new();
        let mut return_route = Vec::new();

        for frame in frames {
            if section < 2 && frame.is_empty() {
                section += 1;
                continue;
            }
            match section {
                0 => route.push(identity_from_frame(&frame)?),
                1 => messages.push(frame),
                _ => return_route.push(identity_from_frame(&frame)?),
            }
        }
        if section < 2 {
            return Err(MeshError::Malformed(format!(
                "expected 2 section separators, found {section}"
            )));
        }

        if flags & TRACK_ROUTE != 0 && return_route.is_empty() {
            if let Some(sender) = sender {
                return_route.push(sender.to_string());
            }
        }

        Ok(Self {
            message_type,
            messages,
            route,
            return_route,
            flags,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} route={:?} return_route={:?} messages={}",
            self.message_type,
            self.route,
            self.return_route,
            self.messages.len()
        )
    }
}

fn normalize_route<I, S>(route: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    route
        .into_iter()
        .map(Into::into)
        .filter(|hop: &String| !hop.is_empty())
        .collect()
}

fn identity_from_frame(frame: &Bytes) -> Result<String, MeshError> {
    if frame.is_empty() {
        return Err(MeshError::Malformed("empty identity frame".into()));
    }
    std::str::from_utf8(frame)
        .map(str::to_string)
        .map_err(|_| MeshError::Malformed("identity is not UTF-8".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
