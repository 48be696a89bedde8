//! SDP (RFC 4566) on top of `sdp_rs`: what a call needs from one audio
//! stream (codecs, direction, connection address) and SDES `a=crypto`
//! (RFC 4568) keying.
use super::{Codec, MediaDirection};
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use sdp_rs::lines::{
    attribute::Rtpmap,
    common::Addrtype,
    media::{MediaType, ProtoType},
    Attribute, Media,
};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

pub use sdp_rs::{MediaDescription, SessionDescription};

pub const SUITE_AES_CM_128_HMAC_SHA1_80: &str = "AES_CM_128_HMAC_SHA1_80";
pub const SUITE_AES_CM_128_HMAC_SHA1_32: &str = "AES_CM_128_HMAC_SHA1_32";
/// Suites we can key, in order of preference.
pub const SUPPORTED_SUITES: [&str; 2] =
    [SUITE_AES_CM_128_HMAC_SHA1_80, SUITE_AES_CM_128_HMAC_SHA1_32];
/// 16 byte master key followed by a 14 byte master salt.
const MASTER_KEY_SALT_LEN: usize = 30;

const CRYPTO: &str = "crypto";

/// Session-level lines of every description we send; origin and
/// connection are filled in per call.
const SESSION_TEMPLATE: &str =
    "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n";

fn invalid(reason: impl fmt::Display) -> Error {
    Error::NoCommonMediaError(format!("invalid session description: {}", reason))
}

/// `a=crypto:<tag> <suite> inline:<key||salt>[|lifetime][|mki] [params]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAttribute {
    pub tag: u32,
    pub suite: String,
    pub key_params: String,
    pub session_params: Option<String>,
}

impl CryptoAttribute {
    /// Fresh random key material for `suite`.
    pub fn generate(tag: u32, suite: &str) -> Self {
        let mut material = [0u8; MASTER_KEY_SALT_LEN];
        rand::rng().fill_bytes(&mut material);
        CryptoAttribute {
            tag,
            suite: suite.to_string(),
            key_params: STANDARD.encode(material),
            session_params: None,
        }
    }

    /// The base64 key and salt without lifetime or MKI suffixes.
    pub fn key(&self) -> &str {
        self.key_params
            .split('|')
            .next()
            .unwrap_or(self.key_params.as_str())
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_SUITES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&self.suite))
            && STANDARD
                .decode(self.key())
                .map(|k| k.len() == MASTER_KEY_SALT_LEN)
                .unwrap_or(false)
    }

    pub fn to_attribute(&self) -> Attribute {
        Attribute::Other(CRYPTO.to_string(), Some(self.to_string()))
    }
}

impl FromStr for CryptoAttribute {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let tag = parts
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| invalid("crypto tag"))?;
        let suite = parts.next().ok_or_else(|| invalid("crypto suite"))?;
        let key_params = parts
            .next()
            .and_then(|k| k.strip_prefix("inline:"))
            .filter(|k| !k.is_empty())
            .ok_or_else(|| invalid("crypto key params"))?;
        let rest = parts.collect::<Vec<_>>();
        Ok(CryptoAttribute {
            tag,
            suite: suite.to_string(),
            key_params: key_params.to_string(),
            session_params: if rest.is_empty() {
                None
            } else {
                Some(rest.join(" "))
            },
        })
    }
}

impl fmt::Display for CryptoAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} inline:{}", self.tag, self.suite, self.key_params)?;
        if let Some(params) = &self.session_params {
            write!(f, " {}", params)?;
        }
        Ok(())
    }
}

impl MediaDirection {
    pub fn to_attribute(&self) -> Attribute {
        match self {
            MediaDirection::SendRecv => Attribute::Sendrecv,
            MediaDirection::SendOnly => Attribute::Sendonly,
            MediaDirection::RecvOnly => Attribute::Recvonly,
            MediaDirection::Inactive => Attribute::Inactive,
        }
    }

    pub fn from_attribute(attribute: &Attribute) -> Option<Self> {
        match attribute {
            Attribute::Sendrecv => Some(MediaDirection::SendRecv),
            Attribute::Sendonly => Some(MediaDirection::SendOnly),
            Attribute::Recvonly => Some(MediaDirection::RecvOnly),
            Attribute::Inactive => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

impl Codec {
    pub fn to_attribute(&self) -> Attribute {
        Attribute::Rtpmap(Rtpmap {
            payload_type: self.payload_type.into(),
            encoding_name: self.name.clone(),
            clock_rate: self.clock_rate as i32,
            encoding_params: self.channels.filter(|c| *c > 1).map(Into::into),
        })
    }

    fn from_rtpmap(rtpmap: &Rtpmap) -> Option<Self> {
        Some(Codec {
            payload_type: u8::try_from(rtpmap.payload_type).ok()?,
            name: rtpmap.encoding_name.clone(),
            clock_rate: u32::try_from(rtpmap.clock_rate).ok()?,
            channels: rtpmap
                .encoding_params
                .as_ref()
                .and_then(|p| p.to_string().parse().ok()),
        })
    }
}

fn static_codec(payload_type: u8) -> Option<Codec> {
    match payload_type {
        0 => Some(Codec::pcmu()),
        8 => Some(Codec::pcma()),
        9 => Some(Codec::g722()),
        18 => Some(Codec::new(18, "G729", 8000)),
        _ => None,
    }
}

/// Audio offered or answered over RTP/AVP, or over RTP/SAVP when `secure`.
pub fn audio_media(
    port: u16,
    secure: bool,
    codecs: &[Codec],
    crypto: &[CryptoAttribute],
    direction: MediaDirection,
) -> MediaDescription {
    let mut attributes = codecs.iter().map(Codec::to_attribute).collect::<Vec<_>>();
    attributes.extend(crypto.iter().map(CryptoAttribute::to_attribute));
    attributes.push(direction.to_attribute());
    MediaDescription {
        media: Media {
            media: MediaType::Audio,
            port,
            num_of_ports: None,
            proto: if secure {
                ProtoType::RtpSavp
            } else {
                ProtoType::RtpAvp
            },
            fmt: codecs
                .iter()
                .map(|c| c.payload_type.to_string())
                .collect::<Vec<_>>()
                .join(" "),
        },
        info: None,
        connections: vec![],
        bandwidths: vec![],
        key: None,
        attributes,
    }
}

fn addrtype_of(address: &IpAddr) -> Addrtype {
    match address {
        IpAddr::V4(_) => Addrtype::Ip4,
        IpAddr::V6(_) => Addrtype::Ip6,
    }
}

/// Accessors on a parsed description, and the constructors we send with.
pub trait SessionDescriptionExt: Sized {
    /// A session from `address` with no media yet.
    fn new_session(address: IpAddr, session_id: u64, session_version: u64) -> Result<Self>;
    /// Parse a message body.
    fn from_body(body: &[u8]) -> Result<Self>;
    /// First audio stream with a non-zero port.
    fn audio(&self) -> Option<&MediaDescription>;
    /// Where RTP for `media` goes: media-level connection, else session level.
    fn rtp_addr(&self, media: &MediaDescription) -> Result<SocketAddr>;
    /// Effective direction of `media`; media-level attributes win.
    fn direction_of(&self, media: &MediaDescription) -> MediaDirection;
}

impl SessionDescriptionExt for SessionDescription {
    fn new_session(address: IpAddr, session_id: u64, session_version: u64) -> Result<Self> {
        let mut sd = SessionDescription::try_from(SESSION_TEMPLATE)
            .map_err(|e| invalid(format!("{:?}", e)))?;
        sd.origin.sess_id = session_id.to_string();
        sd.origin.sess_version = session_version.to_string();
        sd.origin.addrtype = addrtype_of(&address);
        sd.origin.unicast_address = address;
        if let Some(connection) = sd.connection.as_mut() {
            connection.addrtype = addrtype_of(&address);
            connection.connection_address.base = address;
        }
        Ok(sd)
    }

    fn from_body(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).map_err(|_| invalid("body is not utf-8"))?;
        SessionDescription::try_from(text).map_err(|e| invalid(format!("{:?}", e)))
    }

    fn audio(&self) -> Option<&MediaDescription> {
        self.media_descriptions
            .iter()
            .find(|m| matches!(m.media.media, MediaType::Audio) && m.media.port != 0)
    }

    fn rtp_addr(&self, media: &MediaDescription) -> Result<SocketAddr> {
        let ip = media
            .connections
            .first()
            .or(self.connection.as_ref())
            .map(|c| c.connection_address.base)
            .ok_or_else(|| invalid("no connection address"))?;
        Ok(SocketAddr::new(ip, media.media.port))
    }

    fn direction_of(&self, media: &MediaDescription) -> MediaDirection {
        media
            .direction()
            .or_else(|| self.attributes.iter().find_map(MediaDirection::from_attribute))
            .unwrap_or_default()
    }
}

pub trait MediaDescriptionExt {
    /// Codecs in the order of the m= line. Static payload types without an
    /// rtpmap fall back to their RFC 3551 names.
    fn codecs(&self) -> Vec<Codec>;
    /// Well-formed `a=crypto` lines, in order. Malformed ones are skipped.
    fn crypto(&self) -> Vec<CryptoAttribute>;
    fn direction(&self) -> Option<MediaDirection>;
    fn is_secure_profile(&self) -> bool;
}

impl MediaDescriptionExt for MediaDescription {
    fn codecs(&self) -> Vec<Codec> {
        let rtpmap = self
            .attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::Rtpmap(rtpmap) => Codec::from_rtpmap(rtpmap),
                _ => None,
            })
            .collect::<Vec<_>>();
        self.media
            .fmt
            .split_whitespace()
            .filter_map(|f| f.parse::<u8>().ok())
            .filter_map(|pt| {
                rtpmap
                    .iter()
                    .find(|c| c.payload_type == pt)
                    .cloned()
                    .or_else(|| static_codec(pt))
            })
            .collect()
    }

    fn crypto(&self) -> Vec<CryptoAttribute> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::Other(name, Some(value)) if name.eq_ignore_ascii_case(CRYPTO) => {
                    match value.parse() {
                        Ok(crypto) => Some(crypto),
                        Err(e) => {
                            tracing::debug!("skipping crypto attribute: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            })
            .collect()
    }

    fn direction(&self) -> Option<MediaDirection> {
        self.attributes.iter().find_map(MediaDirection::from_attribute)
    }

    fn is_secure_profile(&self) -> bool {
        matches!(self.media.proto, ProtoType::RtpSavp)
    }
}
