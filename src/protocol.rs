//! Media stream wire protocol.
//!
//! Every frame is a JSON object discriminated by its `event` field. Talkdesk
//! and Exotel speak near-identical dialects, so each variant gets its own wire
//! schema and both are normalized into [`StreamEvent`].

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::base64box::Base64Box;
use crate::error::BridgeError;
use crate::interleave::Track;

const KNOWN_EVENTS: [&str; 4] = ["connected", "start", "media", "stop"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Talkdesk,
    Exotel,
}

impl FromStr for ProtocolVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "talkdesk" => Ok(ProtocolVariant::Talkdesk),
            "exotel" => Ok(ProtocolVariant::Exotel),
            other => Err(anyhow::anyhow!("unknown source platform: {other}")),
        }
    }
}

/// How media chunks map onto the agent and customer tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackRoutingPolicy {
    /// Each chunk names its track (`inbound` → agent, `outbound` → customer).
    Tagged,
    /// The platform sends one combined channel; it is written to both tracks.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Mulaw,
    Linear16,
}

impl ProtocolVariant {
    pub fn default_routing(self) -> TrackRoutingPolicy {
        match self {
            ProtocolVariant::Talkdesk => TrackRoutingPolicy::Tagged,
            ProtocolVariant::Exotel => TrackRoutingPolicy::Duplicate,
        }
    }

    pub fn encoding(self) -> AudioEncoding {
        match self {
            ProtocolVariant::Talkdesk => AudioEncoding::Mulaw,
            ProtocolVariant::Exotel => AudioEncoding::Linear16,
        }
    }

    /// Decodes one wire frame.
    ///
    /// Frames without an `event` string, or whose body does not fit the
    /// variant's schema, are [`BridgeError::MalformedEvent`]; an unrecognized
    /// discriminator is [`BridgeError::UnknownEvent`].
    pub fn parse(self, raw: &[u8]) -> Result<StreamEvent, BridgeError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| BridgeError::MalformedEvent(format!("invalid json: {e}")))?;
        let event = match value.get("event") {
            Some(Value::String(event)) => event.clone(),
            Some(_) => return Err(BridgeError::MalformedEvent("`event` is not a string".into())),
            None => return Err(BridgeError::MalformedEvent("missing `event` field".into())),
        };
        if !KNOWN_EVENTS.contains(&event.as_str()) {
            return Err(BridgeError::UnknownEvent(event));
        }
        let parsed = match self {
            ProtocolVariant::Talkdesk => {
                serde_json::from_value::<WireMessage<TalkdeskMediaFormat>>(value)
                    .map(StreamEvent::from)
            }
            ProtocolVariant::Exotel => {
                serde_json::from_value::<WireMessage<ExotelMediaFormat>>(value)
                    .map(StreamEvent::from)
            }
        };
        parsed.map_err(|e| BridgeError::MalformedEvent(format!("{event}: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { protocol: String, version: String },
    Start(StartEvent),
    Media(MediaEvent),
    Stop(StopEvent),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Start(_) => "start",
            StreamEvent::Media(_) => "media",
            StreamEvent::Stop(_) => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartEvent {
    pub account_sid: String,
    pub call_sid: String,
    pub stream_sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub media_format: MediaFormat,
    pub custom_parameters: BTreeMap<String, String>,
}

impl StartEvent {
    pub fn authorize(&self, expected_account: &str) -> Result<(), BridgeError> {
        if self.account_sid == expected_account {
            Ok(())
        } else {
            Err(BridgeError::Authorization {
                received: self.account_sid.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub stream_sid: Option<String>,
    pub track: Option<String>,
    pub payload: Vec<u8>,
}

impl MediaEvent {
    /// Track named by the chunk's tag, if it is one we understand.
    pub fn tagged_track(&self) -> Option<Track> {
        match self.track.as_deref() {
            Some("inbound") => Some(Track::Agent),
            Some("outbound") => Some(Track::Customer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopEvent {
    pub account_sid: Option<String>,
    pub call_sid: String,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireMessage<F> {
    Connected {
        #[serde(default)]
        protocol: String,
        #[serde(default)]
        version: String,
    },
    Start {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        start: WireStart<F>,
    },
    Media {
        #[serde(rename = "streamSid", alias = "stream_sid", default)]
        stream_sid: Option<String>,
        media: WireMedia,
    },
    Stop {
        stop: WireStop,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStart<F> {
    account_sid: String,
    call_sid: String,
    #[serde(default)]
    stream_sid: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    media_format: F,
    #[serde(default, alias = "custom_parameters")]
    custom_parameters: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct WireMedia {
    #[serde(default)]
    track: Option<String>,
    payload: Base64Box,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStop {
    #[serde(default)]
    account_sid: Option<String>,
    call_sid: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TalkdeskMediaFormat {
    encoding: String,
    sample_rate: u32,
    channels: u16,
}

impl From<TalkdeskMediaFormat> for MediaFormat {
    fn from(f: TalkdeskMediaFormat) -> Self {
        MediaFormat {
            encoding: f.encoding,
            sample_rate: Some(f.sample_rate),
            channels: Some(f.channels),
        }
    }
}

#[derive(Deserialize)]
struct ExotelMediaFormat {
    encoding: String,
    sample_rate: String,
    #[serde(default)]
    #[allow(dead_code)]
    bit_rate: Option<String>,
}

impl From<ExotelMediaFormat> for MediaFormat {
    fn from(f: ExotelMediaFormat) -> Self {
        MediaFormat {
            encoding: f.encoding,
            sample_rate: f.sample_rate.trim().parse().ok(),
            channels: None,
        }
    }
}

impl<F: Into<MediaFormat>> From<WireMessage<F>> for StreamEvent {
    fn from(msg: WireMessage<F>) -> Self {
        match msg {
            WireMessage::Connected { protocol, version } => {
                StreamEvent::Connected { protocol, version }
            }
            WireMessage::Start { stream_sid, start } => StreamEvent::Start(StartEvent {
                account_sid: start.account_sid,
                call_sid: start.call_sid,
                stream_sid: start.stream_sid.or(stream_sid),
                from: start.from,
                to: start.to,
                media_format: start.media_format.into(),
                custom_parameters: start.custom_parameters,
            }),
            WireMessage::Media { stream_sid, media } => StreamEvent::Media(MediaEvent {
                stream_sid,
                track: media.track,
                payload: media.payload.into_inner(),
            }),
            WireMessage::Stop { stop } => StreamEvent::Stop(StopEvent {
                account_sid: stop.account_sid,
                call_sid: stop.call_sid,
                reason: stop.reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_talkdesk_start() {
        let raw = br#"{"event":"start","sequenceNumber":"1","streamSid":"MZ1","start":{
            "accountSid":"AC1","callSid":"CA1","streamSid":"MZ1",
            "mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}}"#;
        let StreamEvent::Start(start) = ProtocolVariant::Talkdesk.parse(raw).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.account_sid, "AC1");
        assert_eq!(start.call_sid, "CA1");
        assert_eq!(start.from, None);
        assert_eq!(start.media_format.sample_rate, Some(8000));
        assert_eq!(start.media_format.channels, Some(1));
    }

    #[test]
    fn parses_exotel_start_with_string_rates() {
        let raw = br#"{"event":"start","sequence_number":1,"stream_sid":"s1","start":{
            "accountSid":"exo","callSid":"c9","from":"+911","to":"+912",
            "custom_parameters":{"lang":"hi"},
            "mediaFormat":{"encoding":"base64","sample_rate":"8000","bit_rate":"128kbps"}}}"#;
        let StreamEvent::Start(start) = ProtocolVariant::Exotel.parse(raw).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.stream_sid.as_deref(), Some("s1"));
        assert_eq!(start.from.as_deref(), Some("+911"));
        assert_eq!(start.media_format.sample_rate, Some(8000));
        assert_eq!(start.custom_parameters.get("lang").map(String::as_str), Some("hi"));
    }

    #[test]
    fn talkdesk_schema_rejects_exotel_media_format() {
        let raw = br#"{"event":"start","start":{"accountSid":"a","callSid":"c",
            "mediaFormat":{"encoding":"x","sample_rate":"8000"}}}"#;
        assert!(matches!(
            ProtocolVariant::Talkdesk.parse(raw),
            Err(BridgeError::MalformedEvent(_))
        ));
    }

    #[test]
    fn parses_media_and_routes_tags() {
        let raw = br#"{"event":"media","streamSid":"MZ1","media":{"track":"outbound","chunk":"2","timestamp":"40","payload":"/+8="}}"#;
        let StreamEvent::Media(media) = ProtocolVariant::Talkdesk.parse(raw).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(media.payload, vec![0xff, 0xef]);
        assert_eq!(media.tagged_track(), Some(Track::Customer));
    }

    #[test]
    fn parses_stop_with_reason() {
        let raw = br#"{"event":"stop","stop":{"accountSid":"a","callSid":"c","reason":"callended"}}"#;
        let event = ProtocolVariant::Exotel.parse(raw).unwrap();
        assert_eq!(
            event,
            StreamEvent::Stop(StopEvent {
                account_sid: Some("a".into()),
                call_sid: "c".into(),
                reason: Some("callended".into()),
            })
        );
    }

    #[test]
    fn classifies_bad_frames() {
        let variant = ProtocolVariant::Talkdesk;
        assert!(matches!(variant.parse(b"{not json"), Err(BridgeError::MalformedEvent(_))));
        assert!(matches!(variant.parse(br#"{"media":{}}"#), Err(BridgeError::MalformedEvent(_))));
        assert!(matches!(variant.parse(br#"{"event":7}"#), Err(BridgeError::MalformedEvent(_))));
        assert!(matches!(
            variant.parse(br#"{"event":"mark","mark":{}}"#),
            Err(BridgeError::UnknownEvent(name)) if name == "mark"
        ));
        assert!(matches!(
            variant.parse(br#"{"event":"media","media":{"payload":"%%%"}}"#),
            Err(BridgeError::MalformedEvent(_))
        ));
    }

    #[test]
    fn authorize_compares_account() {
        let start = StartEvent {
            account_sid: "AC1".into(),
            call_sid: "CA1".into(),
            stream_sid: None,
            from: None,
            to: None,
            media_format: MediaFormat {
                encoding: "audio/x-mulaw".into(),
                sample_rate: Some(8000),
                channels: Some(1),
            },
            custom_parameters: BTreeMap::new(),
        };
        assert!(start.authorize("AC1").is_ok());
        assert!(start.authorize("AC2").unwrap_err().closes_connection());
    }

    #[test]
    fn variant_defaults() {
        assert_eq!("EXOTEL".parse::<ProtocolVariant>().unwrap(), ProtocolVariant::Exotel);
        assert_eq!(ProtocolVariant::Talkdesk.default_routing(), TrackRoutingPolicy::Tagged);
        assert_eq!(ProtocolVariant::Exotel.encoding(), AudioEncoding::Linear16);
    }
}
