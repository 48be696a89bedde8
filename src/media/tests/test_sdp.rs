use crate::media::{
    sdp::{
        audio_media, CryptoAttribute, MediaDescriptionExt, SessionDescription,
        SessionDescriptionExt,
    },
    Codec, MediaDirection,
};
use crate::Error;

const OFFER: &str = "v=0\r\n\
o=alice 2890844526 2890844527 IN IP4 192.0.2.10\r\n\
s=call\r\n\
c=IN IP4 192.0.2.10\r\n\
t=0 0\r\n\
m=audio 49170 RTP/SAVP 0 8 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz|2^20|1:32\r\n\
a=ptime:20\r\n\
a=sendonly\r\n";

#[test]
fn test_parse_offer() -> crate::Result<()> {
    let sd = SessionDescription::from_body(OFFER.as_bytes())?;
    assert_eq!(sd.origin.sess_id, "2890844526");
    assert_eq!(sd.origin.username, "alice");
    let audio = sd.audio().expect("audio");
    assert_eq!(audio.media.port, 49170);
    assert!(audio.is_secure_profile());
    // static types resolve without rtpmap
    assert_eq!(
        audio.codecs(),
        vec![
            Codec::pcmu(),
            Codec::pcma(),
            Codec {
                payload_type: 111,
                name: "opus".to_string(),
                clock_rate: 48000,
                channels: Some(2)
            }
        ]
    );
    let crypto = audio.crypto();
    assert_eq!(crypto.len(), 1);
    assert_eq!(crypto[0].key(), "WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz");
    assert_eq!(crypto[0].key_params, "WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz|2^20|1:32");
    assert!(crypto[0].is_supported());
    assert_eq!(sd.direction_of(audio), MediaDirection::SendOnly);
    assert_eq!(sd.rtp_addr(audio)?.to_string(), "192.0.2.10:49170");

    let reparsed = SessionDescription::from_body(sd.to_string().as_bytes())?;
    let again = reparsed.audio().expect("audio");
    assert_eq!(again.codecs(), audio.codecs());
    assert_eq!(again.crypto(), crypto);
    assert_eq!(reparsed.direction_of(again), MediaDirection::SendOnly);
    Ok(())
}

#[test]
fn test_built_description() -> crate::Result<()> {
    let mut sd = SessionDescription::new_session("192.0.2.20".parse().expect("ip"), 7, 8)?;
    let crypto = CryptoAttribute::generate(1, "AES_CM_128_HMAC_SHA1_80");
    sd.media_descriptions.push(audio_media(
        6000,
        true,
        &[Codec::pcma(), Codec::g722()],
        std::slice::from_ref(&crypto),
        MediaDirection::RecvOnly,
    ));

    let parsed = SessionDescription::from_body(sd.to_string().as_bytes())?;
    assert_eq!(parsed.origin.sess_id, "7");
    assert_eq!(parsed.origin.sess_version, "8");
    let audio = parsed.audio().expect("audio");
    assert!(audio.is_secure_profile());
    assert_eq!(audio.codecs(), vec![Codec::pcma(), Codec::g722()]);
    assert_eq!(audio.crypto(), vec![crypto]);
    assert_eq!(audio.direction(), Some(MediaDirection::RecvOnly));
    assert_eq!(parsed.rtp_addr(audio)?.to_string(), "192.0.2.20:6000");
    Ok(())
}

#[test]
fn test_media_level_connection_wins() -> crate::Result<()> {
    let sd = SessionDescription::from_body(
        b"v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\nc=IN IP4 10.0.0.2\r\n",
    )?;
    let audio = sd.audio().expect("audio");
    assert_eq!(sd.rtp_addr(audio)?.to_string(), "10.0.0.2:4000");
    assert_eq!(sd.direction_of(audio), MediaDirection::SendRecv);
    assert!(audio.crypto().is_empty());
    Ok(())
}

#[test]
fn test_invalid_descriptions() {
    assert!(matches!(
        SessionDescription::from_body(b"v=0\r\ns=-\r\n"),
        Err(Error::NoCommonMediaError(_))
    ));
    assert!(SessionDescription::from_body(b"not a session description").is_err());
    assert!(matches!(
        SessionDescription::from_body(&[0xff, 0xfe]),
        Err(Error::NoCommonMediaError(_))
    ));
}

#[test]
fn test_crypto_attribute() -> crate::Result<()> {
    let crypto: CryptoAttribute =
        "2 AES_CM_128_HMAC_SHA1_32 inline:NzB4d1BINUAvLEw6UzF3WSJ+PSdFcGdUJShpX1Zj KDR=1 UNENCRYPTED_SRTP"
            .parse()?;
    assert_eq!(crypto.tag, 2);
    assert_eq!(crypto.suite, "AES_CM_128_HMAC_SHA1_32");
    assert_eq!(
        crypto.session_params.as_deref(),
        Some("KDR=1 UNENCRYPTED_SRTP")
    );
    assert_eq!(
        crypto.to_string(),
        "2 AES_CM_128_HMAC_SHA1_32 inline:NzB4d1BINUAvLEw6UzF3WSJ+PSdFcGdUJShpX1Zj KDR=1 UNENCRYPTED_SRTP"
    );

    assert!("1 AES_CM_128_HMAC_SHA1_80 inline"
        .parse::<CryptoAttribute>()
        .is_err());
    assert!("x AES_CM_128_HMAC_SHA1_80 inline:abcd"
        .parse::<CryptoAttribute>()
        .is_err());
    // wrong key length
    let short: CryptoAttribute = "1 AES_CM_128_HMAC_SHA1_80 inline:YWJjZA==".parse()?;
    assert!(!short.is_supported());

    let generated = CryptoAttribute::generate(1, "AES_CM_128_HMAC_SHA1_80");
    assert!(generated.is_supported());
    assert_ne!(
        generated.key(),
        CryptoAttribute::generate(1, "AES_CM_128_HMAC_SHA1_80").key()
    );
    Ok(())
}
