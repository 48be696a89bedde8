//! Offer/answer media negotiation.
//!
//! The dialog layer asks a [`MediaNegotiator`] for offers and answers and
//! gets back an immutable [`MediaSession`] once both sides agree. Audio
//! capture and RTP live outside this crate behind [`MediaBackend`].
use crate::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, sync::Arc};

pub mod negotiate;
pub mod sdp;
pub use negotiate::MediaNegotiator;
pub use sdp::{CryptoAttribute, MediaDescriptionExt, SessionDescription, SessionDescriptionExt};

#[cfg(test)]
mod tests;

/// How SRTP is required of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtpPolicy {
    /// Only secure media is acceptable.
    Mandatory,
    /// Secure media when the peer offers it, plain RTP otherwise.
    #[default]
    Optional,
    /// Plain RTP; crypto attributes from the peer are ignored.
    Disabled,
}

/// Audio codec as carried in an `a=rtpmap` line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
}

impl Codec {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32) -> Self {
        Codec {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels: None,
        }
    }

    pub fn pcmu() -> Self {
        Codec::new(0, "PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Codec::new(8, "PCMA", 8000)
    }

    pub fn g722() -> Self {
        Codec::new(9, "G722", 8000)
    }

    pub fn opus() -> Self {
        Codec {
            payload_type: 111,
            name: "opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
        }
    }

    /// Static payload types match by number, dynamic ones by encoding
    /// name and clock rate.
    pub fn matches(&self, other: &Codec) -> bool {
        if self.payload_type < 96 && other.payload_type < 96 {
            return self.payload_type == other.payload_type;
        }
        self.name.eq_ignore_ascii_case(&other.name) && self.clock_rate == other.clock_rate
    }

    pub fn rtpmap(&self) -> String {
        match self.channels {
            Some(channels) if channels > 1 => {
                format!("{}/{}/{}", self.name, self.clock_rate, channels)
            }
            _ => format!("{}/{}", self.name, self.clock_rate),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.payload_type, self.rtpmap())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    /// Direction an answerer uses for an offer in this direction.
    pub fn reverse(&self) -> Self {
        match self {
            MediaDirection::SendRecv => MediaDirection::SendRecv,
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            MediaDirection::Inactive => MediaDirection::Inactive,
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }

    pub fn attribute(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attribute())
    }
}

/// Agreed SDES keying: one suite, one key per direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrtpParameters {
    pub suite: String,
    /// Base64 master key and salt we encrypt with.
    pub local_key: String,
    /// Base64 master key and salt the peer encrypts with.
    pub remote_key: String,
}

/// Result of a completed offer/answer exchange. Never mutated: a
/// renegotiation produces a new session that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaSession {
    pub codec: Codec,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Direction from the local point of view.
    pub direction: MediaDirection,
    pub srtp: Option<SrtpParameters>,
}

impl MediaSession {
    pub fn is_secure(&self) -> bool {
        self.srtp.is_some()
    }
}

impl fmt::Display for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} {}{}",
            self.codec,
            self.local_addr,
            self.remote_addr,
            self.direction,
            if self.is_secure() { " srtp" } else { "" }
        )
    }
}

/// The external audio path: what it can encode, and where to send it.
#[async_trait::async_trait]
pub trait MediaBackend: Send + Sync {
    /// Codecs in order of preference.
    fn capabilities(&self) -> Vec<Codec>;
    /// Start or update media for a call once negotiation completed.
    async fn apply(&self, session: Arc<MediaSession>) -> Result<()>;
    /// Stop media for a call.
    async fn release(&self, _session: Arc<MediaSession>) -> Result<()> {
        Ok(())
    }
}

/// Backend that only reports a fixed codec list. Used when the
/// application drives audio itself from the session events.
pub struct StaticMediaBackend {
    codecs: Vec<Codec>,
}

impl StaticMediaBackend {
    pub fn new(codecs: Vec<Codec>) -> Self {
        StaticMediaBackend { codecs }
    }
}

#[async_trait::async_trait]
impl MediaBackend for StaticMediaBackend {
    fn capabilities(&self) -> Vec<Codec> {
        self.codecs.clone()
    }

    async fn apply(&self, session: Arc<MediaSession>) -> Result<()> {
        tracing::debug!(%session, "media session applied");
        Ok(())
    }
}
