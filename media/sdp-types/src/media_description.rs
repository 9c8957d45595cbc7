use crate::{
    Connection, Direction, IceCandidate, IcePassword, IceUsernameFragment, Media, RtpMap,
    UnknownAttribute,
};
use std::fmt;

/// A media description: the `m=` line and every line below it until the
/// next `m=` line
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub media: Media,
    pub connection: Option<Connection>,
    pub direction: Option<Direction>,
    pub rtpmaps: Vec<RtpMap>,
    pub ice_ufrag: Option<IceUsernameFragment>,
    pub ice_pwd: Option<IcePassword>,
    pub candidates: Vec<IceCandidate>,
    pub attributes: Vec<UnknownAttribute>,
}

impl MediaDescription {
    pub fn new(media: Media) -> Self {
        Self {
            media,
            connection: None,
            direction: None,
            rtpmaps: vec![],
            ice_ufrag: None,
            ice_pwd: None,
            candidates: vec![],
            attributes: vec![],
        }
    }

    /// rtpmap for the given payload number
    pub fn rtpmap(&self, payload: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|rtpmap| rtpmap.payload == payload)
    }

    /// True if this media description carries any ICE attribute
    pub fn has_ice_attributes(&self) -> bool {
        self.ice_ufrag.is_some() || self.ice_pwd.is_some() || !self.candidates.is_empty()
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\r", self.media)?;

        if let Some(connection) = &self.connection {
            writeln!(f, "{connection}\r")?;
        }

        for rtpmap in &self.rtpmaps {
            writeln!(f, "a=rtpmap:{rtpmap}\r")?;
        }

        if let Some(direction) = self.direction {
            writeln!(f, "a={direction}\r")?;
        }

        if let Some(ice_ufrag) = &self.ice_ufrag {
            writeln!(f, "{ice_ufrag}\r")?;
        }

        if let Some(ice_pwd) = &self.ice_pwd {
            writeln!(f, "{ice_pwd}\r")?;
        }

        for candidate in &self.candidates {
            writeln!(f, "a=candidate:{candidate}\r")?;
        }

        for attribute in &self.attributes {
            writeln!(f, "{attribute}\r")?;
        }

        Ok(())
    }
}
