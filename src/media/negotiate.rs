use super::{
    sdp::{
        audio_media, CryptoAttribute, MediaDescription, MediaDescriptionExt, SessionDescription,
        SessionDescriptionExt, SUPPORTED_SUITES,
    },
    Codec, MediaDirection, MediaSession, SrtpParameters, SrtpPolicy,
};
use crate::{Error, Result};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// Builds offers and answers for one call and turns a completed exchange
/// into a [`MediaSession`].
///
/// Key material is generated once per negotiator, so negotiating the same
/// offer and answer twice yields identical sessions and a re-INVITE keeps
/// the keys of its call. Use [`MediaNegotiator::for_call`] to get a
/// negotiator with fresh keys for each new call.
pub struct MediaNegotiator {
    codecs: Vec<Codec>,
    policy: SrtpPolicy,
    local_addr: SocketAddr,
    session_id: u64,
    session_version: AtomicU64,
    crypto: Vec<CryptoAttribute>,
}

fn sends(d: MediaDirection) -> bool {
    matches!(d, MediaDirection::SendRecv | MediaDirection::SendOnly)
}

fn recvs(d: MediaDirection) -> bool {
    matches!(d, MediaDirection::SendRecv | MediaDirection::RecvOnly)
}

fn combine(send: bool, recv: bool) -> MediaDirection {
    match (send, recv) {
        (true, true) => MediaDirection::SendRecv,
        (true, false) => MediaDirection::SendOnly,
        (false, true) => MediaDirection::RecvOnly,
        (false, false) => MediaDirection::Inactive,
    }
}

/// Local codecs also present remotely, in local preference order, carrying
/// the remote payload type.
fn intersect(local: &[Codec], remote: &[Codec]) -> Vec<Codec> {
    local
        .iter()
        .filter_map(|l| remote.iter().find(|r| l.matches(r)).cloned())
        .collect()
}

fn generate_crypto() -> Vec<CryptoAttribute> {
    SUPPORTED_SUITES
        .iter()
        .enumerate()
        .map(|(i, suite)| CryptoAttribute::generate(i as u32 + 1, suite))
        .collect()
}

fn audio_of(sd: &SessionDescription) -> Result<&MediaDescription> {
    sd.audio()
        .ok_or_else(|| Error::NoCommonMediaError("no audio stream".to_string()))
}

impl MediaNegotiator {
    pub fn new(codecs: Vec<Codec>, policy: SrtpPolicy, local_addr: SocketAddr) -> Self {
        MediaNegotiator {
            codecs,
            policy,
            local_addr,
            session_id: rand::random::<u32>() as u64,
            session_version: AtomicU64::new(1),
            crypto: generate_crypto(),
        }
    }

    /// Same codecs, policy and address with a new SDP session id and new
    /// SRTP master keys.
    pub fn for_call(&self) -> Self {
        Self::new(self.codecs.clone(), self.policy, self.local_addr)
    }

    /// Replace the generated key material.
    pub fn with_crypto(mut self, crypto: Vec<CryptoAttribute>) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn policy(&self) -> SrtpPolicy {
        self.policy
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    fn description(&self, media: MediaDescription) -> Result<SessionDescription> {
        let version = self.session_version.fetch_add(1, Ordering::Relaxed);
        let mut sd =
            SessionDescription::new_session(self.local_addr.ip(), self.session_id, version)?;
        sd.media_descriptions.push(media);
        Ok(sd)
    }

    /// Offer every local codec. Crypto attributes are offered unless SRTP
    /// is disabled; only a mandatory policy uses the RTP/SAVP profile.
    pub fn create_offer(&self, direction: MediaDirection) -> Result<SessionDescription> {
        let crypto: &[CryptoAttribute] = match self.policy {
            SrtpPolicy::Disabled => &[],
            _ => &self.crypto,
        };
        self.description(audio_media(
            self.local_addr.port(),
            self.policy == SrtpPolicy::Mandatory,
            &self.codecs,
            crypto,
            direction,
        ))
    }

    /// Answer a received offer. `preferred` is the direction we want
    /// locally; the result never sends or receives more than the offer allows.
    pub fn answer(
        &self,
        offer: &SessionDescription,
        preferred: MediaDirection,
    ) -> Result<(SessionDescription, MediaSession)> {
        let offered = audio_of(offer)?;
        let common = intersect(&self.codecs, &offered.codecs());
        let Some(codec) = common.first().cloned() else {
            return Err(Error::NoCommonMediaError(format!(
                "offered {:?}",
                offered.codecs().iter().map(|c| c.to_string()).collect::<Vec<_>>()
            )));
        };

        let srtp = match self.policy {
            SrtpPolicy::Disabled => None,
            policy => {
                let usable = offered
                    .crypto()
                    .into_iter()
                    .filter(|c| c.is_supported())
                    .find_map(|remote| {
                        self.crypto
                            .iter()
                            .find(|local| local.suite.eq_ignore_ascii_case(&remote.suite))
                            .map(|local| (remote.clone(), local.clone()))
                    });
                if usable.is_none() && policy == SrtpPolicy::Mandatory {
                    return Err(Error::SecurityPolicyError(
                        "offer carries no usable crypto attribute".to_string(),
                    ));
                }
                usable
            }
        };

        let offered_direction = offer.direction_of(offered).reverse();
        let direction = combine(
            sends(preferred) && sends(offered_direction),
            recvs(preferred) && recvs(offered_direction),
        );
        let remote_addr = offer.rtp_addr(offered)?;

        let crypto = srtp
            .iter()
            .map(|(remote, local)| CryptoAttribute {
                tag: remote.tag,
                suite: remote.suite.clone(),
                key_params: local.key_params.clone(),
                session_params: None,
            })
            .collect::<Vec<_>>();
        let answer = self.description(audio_media(
            self.local_addr.port(),
            srtp.is_some() && offered.is_secure_profile(),
            &common,
            &crypto,
            direction,
        ))?;

        let session = MediaSession {
            codec,
            local_addr: self.local_addr,
            remote_addr,
            direction,
            srtp: srtp.map(|(remote, local)| SrtpParameters {
                suite: remote.suite.clone(),
                local_key: local.key().to_string(),
                remote_key: remote.key().to_string(),
            }),
        };
        debug!(%session, "answered offer");
        Ok((answer, session))
    }

    /// Complete an exchange we started. Everything local is taken from
    /// `offer`, so the result depends only on the two descriptions.
    pub fn negotiate(
        &self,
        offer: &SessionDescription,
        answer: &SessionDescription,
    ) -> Result<MediaSession> {
        let offered = audio_of(offer)?;
        let answered = audio_of(answer)?;
        let common = intersect(&offered.codecs(), &answered.codecs());
        let Some(codec) = common.first().cloned() else {
            return Err(Error::NoCommonMediaError(format!(
                "answer {:?}",
                answered.codecs().iter().map(|c| c.to_string()).collect::<Vec<_>>()
            )));
        };

        let srtp = match self.policy {
            SrtpPolicy::Disabled => None,
            policy => {
                let offered_crypto = offered.crypto();
                let agreed = answered.crypto().into_iter().find_map(|remote| {
                    if !remote.is_supported() {
                        return None;
                    }
                    offered_crypto
                        .iter()
                        .find(|local| {
                            local.tag == remote.tag && local.suite.eq_ignore_ascii_case(&remote.suite)
                        })
                        .map(|local| SrtpParameters {
                            suite: local.suite.clone(),
                            local_key: local.key().to_string(),
                            remote_key: remote.key().to_string(),
                        })
                });
                if agreed.is_none() && policy == SrtpPolicy::Mandatory {
                    return Err(Error::SecurityPolicyError(
                        "answer carries no matching crypto attribute".to_string(),
                    ));
                }
                agreed
            }
        };

        let session = MediaSession {
            codec,
            local_addr: offer.rtp_addr(offered)?,
            remote_addr: answer.rtp_addr(answered)?,
            direction: answer.direction_of(answered).reverse(),
            srtp,
        };
        debug!(%session, "negotiated answer");
        Ok(session)
    }
}
