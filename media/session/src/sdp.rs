//! Local SDP generation and remote SDP interpretation for a media session.

use crate::MediaError;
use ice::IceCredentials;
use sdp_types::{
    Connection, Direction, IceCandidate, IcePassword, IceUsernameFragment, Media,
    MediaDescription, MediaType, Origin, RtpMap, SessionDescription, TransportProtocol,
    UntaggedAddress,
};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// What the peer's session description tells us about its audio stream
pub(crate) struct RemoteMedia {
    pub(crate) addr: Option<IpAddr>,
    pub(crate) port: u16,
    /// Payload type we are expected to send
    pub(crate) payload_type: u8,
    /// Encoding name from the matching rtpmap, if any
    pub(crate) codec_name: Option<String>,
    pub(crate) direction: Direction,
    /// ICE credentials and candidates, when the peer offers ICE
    pub(crate) ice: Option<(IceCredentials, Vec<IceCandidate>)>,
}

pub(crate) fn parse_remote_media(sdp: &SessionDescription) -> Result<RemoteMedia, MediaError> {
    let audio = sdp.audio().ok_or(MediaError::NoAudioMedia)?;

    // pick the first payload number we have a codec for
    let (payload_type, codec_name) = audio
        .media
        .fmts
        .iter()
        .find_map(|&fmt| match audio.rtpmap(fmt) {
            Some(rtpmap) => crate::codecs::codec_by_name(&rtpmap.encoding)
                .map(|_| (fmt, Some(rtpmap.encoding.to_string()))),
            // static payload types may come without an rtpmap
            None => crate::codecs::codec_by_payload_type(fmt).map(|_| (fmt, None)),
        })
        .ok_or(MediaError::NoCompatibleCodec)?;

    let direction = audio
        .direction
        .or(sdp.direction)
        .unwrap_or(Direction::SendRecv);

    let ufrag = audio.ice_ufrag.as_ref().or(sdp.ice_ufrag.as_ref());
    let pwd = audio.ice_pwd.as_ref().or(sdp.ice_pwd.as_ref());

    let ice = match (ufrag, pwd) {
        (Some(ufrag), Some(pwd)) => Some((
            IceCredentials {
                ufrag: ufrag.ufrag.to_string(),
                pwd: pwd.pwd.to_string(),
            },
            audio.candidates.clone(),
        )),
        _ => None,
    };

    Ok(RemoteMedia {
        addr: sdp.media_connection(audio),
        port: audio.media.port,
        payload_type,
        codec_name,
        direction,
        ice,
    })
}

/// True if the session description carries any ICE attribute, which decides
/// the session's transport mode
pub(crate) fn offers_ice(sdp: &SessionDescription) -> bool {
    sdp.has_ice_attributes()
}

pub(crate) struct LocalSdpParams<'s> {
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
    pub(crate) payload_type: u8,
    pub(crate) codec_name: &'s str,
    pub(crate) clock_rate: u32,
    pub(crate) direction: Direction,
    pub(crate) ice: Option<(&'s IceCredentials, Vec<IceCandidate>)>,
}

pub(crate) fn build_local_sdp(params: LocalSdpParams<'_>) -> SessionDescription {
    let session_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let mut media_description = MediaDescription::new(Media {
        media_type: MediaType::Audio,
        port: params.port,
        proto: TransportProtocol::RtpAvp,
        fmts: vec![params.payload_type],
    });

    media_description.rtpmaps.push(RtpMap {
        payload: params.payload_type,
        encoding: params.codec_name.into(),
        clock_rate: params.clock_rate,
        params: None,
    });

    media_description.direction = Some(params.direction);

    if let Some((credentials, candidates)) = params.ice {
        media_description.ice_ufrag = Some(IceUsernameFragment {
            ufrag: credentials.ufrag.as_str().into(),
        });
        media_description.ice_pwd = Some(IcePassword {
            pwd: credentials.pwd.as_str().into(),
        });
        media_description.candidates = candidates;
    }

    SessionDescription {
        origin: Origin {
            username: "-".into(),
            session_id,
            session_version: 1,
            address: UntaggedAddress::IpAddress(params.address),
        },
        name: "-".into(),
        connection: Some(Connection {
            address: UntaggedAddress::IpAddress(params.address),
        }),
        direction: None,
        ice_ufrag: None,
        ice_pwd: None,
        media_descriptions: vec![media_description],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_and_reparse() {
        let credentials = IceCredentials::random();

        let sdp = build_local_sdp(LocalSdpParams {
            address: "192.168.1.4".parse().unwrap(),
            port: 40000,
            payload_type: 0,
            codec_name: "PCMU",
            clock_rate: 8000,
            direction: Direction::SendRecv,
            ice: Some((&credentials, vec![])),
        });

        let printed = sdp.to_string();
        let reparsed = SessionDescription::parse(&printed).unwrap();

        assert!(offers_ice(&reparsed));

        let remote = parse_remote_media(&reparsed).unwrap();
        assert_eq!(remote.port, 40000);
        assert_eq!(remote.payload_type, 0);
        assert_eq!(remote.addr, Some("192.168.1.4".parse().unwrap()));
        assert_eq!(remote.ice.unwrap().0, credentials);
    }

    #[test]
    fn plain_offer_has_no_ice() {
        let sdp = build_local_sdp(LocalSdpParams {
            address: "127.0.0.1".parse().unwrap(),
            port: 40000,
            payload_type: 8,
            codec_name: "PCMA",
            clock_rate: 8000,
            direction: Direction::SendRecv,
            ice: None,
        });

        let reparsed = SessionDescription::parse(&sdp.to_string()).unwrap();
        assert!(!offers_ice(&reparsed));

        let remote = parse_remote_media(&reparsed).unwrap();
        assert_eq!(remote.codec_name.as_deref(), Some("PCMA"));
    }

    #[test]
    fn static_payload_without_rtpmap() {
        let offer = "v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 0\r\n";

        let sdp = SessionDescription::parse(offer).unwrap();
        let remote = parse_remote_media(&sdp).unwrap();

        assert_eq!(remote.payload_type, 0);
        assert_eq!(remote.codec_name, None);
    }

    #[test]
    fn unsupported_codecs_are_rejected() {
        let offer = "v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 96\r\n\
            a=rtpmap:96 opus/48000/2\r\n";

        let sdp = SessionDescription::parse(offer).unwrap();

        assert!(matches!(
            parse_remote_media(&sdp),
            Err(MediaError::NoCompatibleCodec)
        ));
    }
}
