use crate::{
    Connection, Direction, IceCandidate, IcePassword, IceUsernameFragment, Media,
    MediaDescription, Origin, RtpMap, UnknownAttribute,
};
use internal::Finish;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum ParseSessionDescriptionError {
    #[error("session description is missing its {0} line")]
    Missing(&'static str),
    #[error("malformed line: {0}")]
    InvalidLine(String),
}

/// A complete session description
#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub origin: Origin,
    /// Session name (`s=`)
    pub name: bytesstr::BytesStr,
    pub connection: Option<Connection>,
    /// Session level direction, inherited by media descriptions without one
    pub direction: Option<Direction>,
    /// Session level ICE credentials, inherited by all media descriptions
    pub ice_ufrag: Option<IceUsernameFragment>,
    pub ice_pwd: Option<IcePassword>,
    pub media_descriptions: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(src: &str) -> Result<Self, ParseSessionDescriptionError> {
        let mut origin = None;
        let mut name = None;
        let mut connection = None;
        let mut direction = None;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut media_descriptions: Vec<MediaDescription> = vec![];

        for raw_line in src.lines() {
            let line = raw_line.trim_end_matches('\r');

            if line.is_empty() {
                continue;
            }

            let Some((kind, value)) = line.split_once('=') else {
                return Err(ParseSessionDescriptionError::InvalidLine(line.into()));
            };

            // attributes and connection apply to the current media
            // description once one was opened
            let current = media_descriptions.last_mut();

            match kind {
                "v" if value != "0" => {
                    return Err(ParseSessionDescriptionError::InvalidLine(line.into()));
                }
                "v" | "t" | "b" | "k" | "z" | "r" => { /* fixed or ignored */ }
                "o" => {
                    origin = Some(finish(Origin::parse(value), line)?);
                }
                "s" => {
                    name = Some(bytesstr::BytesStr::from(value));
                }
                "c" => {
                    let parsed = finish(Connection::parse(value), line)?;

                    match current {
                        Some(media) => media.connection = Some(parsed),
                        None => connection = Some(parsed),
                    }
                }
                "m" => {
                    let media = finish(Media::parse(value), line)?;
                    media_descriptions.push(MediaDescription::new(media));
                }
                "a" => {
                    parse_attribute(
                        value,
                        current,
                        &mut direction,
                        &mut ice_ufrag,
                        &mut ice_pwd,
                        line,
                    )?;
                }
                // unknown line types may appear and are skipped
                _ => {}
            }
        }

        Ok(SessionDescription {
            origin: origin.ok_or(ParseSessionDescriptionError::Missing("o"))?,
            name: name.ok_or(ParseSessionDescriptionError::Missing("s"))?,
            connection,
            direction,
            ice_ufrag,
            ice_pwd,
            media_descriptions,
        })
    }

    /// Connection address of `media`, honoring the media level override
    pub fn media_connection(&self, media: &MediaDescription) -> Option<IpAddr> {
        media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .and_then(|connection| connection.address.ip())
    }

    /// First audio media description
    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media_descriptions
            .iter()
            .find(|media| media.media.media_type == crate::MediaType::Audio)
    }

    /// True if any level of the description carries ICE attributes
    pub fn has_ice_attributes(&self) -> bool {
        self.ice_ufrag.is_some()
            || self.ice_pwd.is_some()
            || self
                .media_descriptions
                .iter()
                .any(MediaDescription::has_ice_attributes)
    }
}

fn parse_attribute(
    value: &str,
    current: Option<&mut MediaDescription>,
    direction: &mut Option<Direction>,
    ice_ufrag: &mut Option<IceUsernameFragment>,
    ice_pwd: &mut Option<IcePassword>,
    line: &str,
) -> Result<(), ParseSessionDescriptionError> {
    if let Some(parsed) = Direction::from_attribute(value) {
        match current {
            Some(media) => media.direction = Some(parsed),
            None => *direction = Some(parsed),
        }

        return Ok(());
    }

    let (attr_name, attr_value) = match value.split_once(':') {
        Some((name, value)) => (name, value),
        None => (value, ""),
    };

    match attr_name {
        "rtpmap" => {
            let rtpmap = finish(RtpMap::parse(attr_value), line)?;

            if let Some(media) = current {
                media.rtpmaps.push(rtpmap);
            }
        }
        "candidate" => {
            let candidate = finish(IceCandidate::parse(attr_value), line)?;

            if let Some(media) = current {
                media.candidates.push(candidate);
            }
        }
        "ice-ufrag" => {
            let parsed = finish(IceUsernameFragment::parse(attr_value), line)?;

            match current {
                Some(media) => media.ice_ufrag = Some(parsed),
                None => *ice_ufrag = Some(parsed),
            }
        }
        "ice-pwd" => {
            let parsed = finish(IcePassword::parse(attr_value), line)?;

            match current {
                Some(media) => media.ice_pwd = Some(parsed),
                None => *ice_pwd = Some(parsed),
            }
        }
        _ => {
            let attribute = UnknownAttribute::parse(value);

            if let Some(media) = current {
                media.attributes.push(attribute);
            }
        }
    }

    Ok(())
}

fn finish<T>(
    result: internal::IResult<&str, T>,
    line: &str,
) -> Result<T, ParseSessionDescriptionError> {
    let (_, parsed) = result
        .finish()
        .map_err(|_| ParseSessionDescriptionError::InvalidLine(line.into()))?;

    Ok(parsed)
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0\r")?;
        writeln!(f, "{}\r", self.origin)?;
        writeln!(f, "s={}\r", self.name)?;

        if let Some(connection) = &self.connection {
            writeln!(f, "{connection}\r")?;
        }

        writeln!(f, "t=0 0\r")?;

        if let Some(direction) = self.direction {
            writeln!(f, "a={direction}\r")?;
        }

        if let Some(ice_ufrag) = &self.ice_ufrag {
            writeln!(f, "{ice_ufrag}\r")?;
        }

        if let Some(ice_pwd) = &self.ice_pwd {
            writeln!(f, "{ice_pwd}\r")?;
        }

        for media_description in &self.media_descriptions {
            media_description.fmt(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::UntaggedAddress;

    const OFFER: &str = "v=0\r\n\
        o=- 1687425326 1 IN IP4 192.168.1.5\r\n\
        s=lark\r\n\
        c=IN IP4 192.168.1.5\r\n\
        t=0 0\r\n\
        m=audio 40000 RTP/AVP 0\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=sendrecv\r\n";

    #[test]
    fn parse_plain_offer() {
        let sdp = SessionDescription::parse(OFFER).unwrap();

        assert_eq!(sdp.name, "lark");
        assert!(!sdp.has_ice_attributes());

        let audio = sdp.audio().unwrap();
        assert_eq!(audio.media.port, 40000);
        assert_eq!(audio.direction, Some(Direction::SendRecv));
        assert_eq!(audio.rtpmap(0).unwrap().encoding, "PCMU");

        assert_eq!(
            sdp.media_connection(audio),
            Some("192.168.1.5".parse().unwrap())
        );
    }

    #[test]
    fn parse_ice_offer() {
        let offer = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            a=ice-ufrag:aF3x\r\n\
            a=ice-pwd:asd90238japaskjdi238aaslkdjfl\r\n\
            a=candidate:H1 1 UDP 2130706431 10.0.0.1 40000 typ host\r\n";

        let sdp = SessionDescription::parse(offer).unwrap();

        assert!(sdp.has_ice_attributes());

        let audio = sdp.audio().unwrap();
        assert_eq!(audio.ice_ufrag.as_ref().unwrap().ufrag, "aF3x");
        assert_eq!(audio.candidates.len(), 1);
        assert_eq!(
            audio.candidates[0].address,
            UntaggedAddress::IpAddress("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn roundtrip() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        let printed = sdp.to_string();
        let reparsed = SessionDescription::parse(&printed).unwrap();

        assert_eq!(printed, reparsed.to_string());
    }

    #[test]
    fn missing_origin_is_rejected() {
        assert!(matches!(
            SessionDescription::parse("v=0\r\ns=x\r\n"),
            Err(ParseSessionDescriptionError::Missing("o"))
        ));
    }

    #[test]
    fn unknown_lines_are_skipped() {
        let offer = format!("{OFFER}x=whatever\r\na=fancy:stuff\r\n");
        let sdp = SessionDescription::parse(&offer).unwrap();

        let audio = sdp.audio().unwrap();
        assert_eq!(audio.attributes.len(), 1);
        assert_eq!(audio.attributes[0].name, "fancy");
    }
}
