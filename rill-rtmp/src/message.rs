//! Typed RTMP messages over the chunk layer.

use crate::amf0::{self, Amf0Value};
use bytes::Bytes;
use shared::buffer::BytesWriter;
use shared::error::{Error, Result};

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACK: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

pub const USER_CONTROL_STREAM_BEGIN: u16 = 0;
pub const USER_CONTROL_STREAM_EOF: u16 = 1;
pub const USER_CONTROL_SET_BUFFER_LENGTH: u16 = 3;
pub const USER_CONTROL_PING_REQUEST: u16 = 6;
pub const USER_CONTROL_PING_RESPONSE: u16 = 7;

/// A complete RTMP message as carried by the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    pub message_type: u8,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn is_audio(&self) -> bool {
        self.message_type == MSG_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.message_type == MSG_VIDEO
    }

    pub fn is_data(&self) -> bool {
        self.message_type == MSG_DATA_AMF0
    }

    pub fn is_command(&self) -> bool {
        self.message_type == MSG_COMMAND_AMF0
    }

    pub fn set_chunk_size(size: u32) -> Self {
        let mut w = BytesWriter::new();
        w.write_u32(size);
        Self {
            message_type: MSG_SET_CHUNK_SIZE,
            timestamp: 0,
            stream_id: 0,
            payload: w.freeze(),
        }
    }

    pub fn window_ack_size(size: u32) -> Self {
        let mut w = BytesWriter::new();
        w.write_u32(size);
        Self {
            message_type: MSG_WINDOW_ACK_SIZE,
            timestamp: 0,
            stream_id: 0,
            payload: w.freeze(),
        }
    }

    pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> Self {
        let mut w = BytesWriter::new();
        w.write_u32(size);
        w.write_u8(limit_type);
        Self {
            message_type: MSG_SET_PEER_BANDWIDTH,
            timestamp: 0,
            stream_id: 0,
            payload: w.freeze(),
        }
    }

    pub fn acknowledgement(sequence: u32) -> Self {
        let mut w = BytesWriter::new();
        w.write_u32(sequence);
        Self {
            message_type: MSG_ACK,
            timestamp: 0,
            stream_id: 0,
            payload: w.freeze(),
        }
    }

    pub fn user_control(event: u16, data: u32) -> Self {
        let mut w = BytesWriter::new();
        w.write_u16(event);
        w.write_u32(data);
        Self {
            message_type: MSG_USER_CONTROL,
            timestamp: 0,
            stream_id: 0,
            payload: w.freeze(),
        }
    }

    pub fn command(stream_id: u32, values: &[Amf0Value]) -> Self {
        Self {
            message_type: MSG_COMMAND_AMF0,
            timestamp: 0,
            stream_id,
            payload: amf0::write_all(values),
        }
    }

    pub fn audio(timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            message_type: MSG_AUDIO,
            timestamp,
            stream_id,
            payload,
        }
    }

    pub fn video(timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            message_type: MSG_VIDEO,
            timestamp,
            stream_id,
            payload,
        }
    }

    pub fn data(stream_id: u32, values: &[Amf0Value]) -> Self {
        Self {
            message_type: MSG_DATA_AMF0,
            timestamp: 0,
            stream_id,
            payload: amf0::write_all(values),
        }
    }

    /// Parses the body of a command message.
    pub fn parse_command(&self) -> Result<Command> {
        if !self.is_command() {
            return Err(Error::RtmpCommand("not a command message".into()));
        }
        let values = amf0::read_all(&self.payload)?;
        if values.is_empty() {
            return Err(Error::RtmpCommand("empty command".into()));
        }
        let name = values[0]
            .as_str()
            .ok_or_else(|| Error::RtmpCommand("command name not a string".into()))?
            .to_string();
        let transaction_id = values
            .get(1)
            .and_then(|v| v.as_number())
            .unwrap_or_default();
        Ok(Command {
            name,
            transaction_id,
            arguments: values.into_iter().skip(2).collect(),
        })
    }

    /// Parses a user control event into (event type, payload word).
    pub fn parse_user_control(&self) -> Result<(u16, u32)> {
        if self.message_type != MSG_USER_CONTROL || self.payload.len() < 6 {
            return Err(Error::RtmpCommand("bad user control".into()));
        }
        let event = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let data = u32::from_be_bytes([
            self.payload[2],
            self.payload[3],
            self.payload[4],
            self.payload[5],
        ]);
        Ok((event, data))
    }
}

/// A decoded AMF0 command: name, transaction id and the trailing values.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    /// Values after the transaction id; for most commands the first is the
    /// (often null) command object.
    pub arguments: Vec<Amf0Value>,
}

impl Command {
    /// First non-null argument after the command object, where `publish`
    /// and `play` carry the stream name.
    pub fn stream_name(&self) -> Option<&str> {
        self.arguments.iter().skip(1).find_map(|v| v.as_str())
    }
}

/// Builds the `_result` reply to `connect`.
pub fn connect_result(transaction_id: f64) -> RtmpMessage {
    RtmpMessage::command(
        0,
        &[
            Amf0Value::String("_result".into()),
            Amf0Value::Number(transaction_id),
            Amf0Value::Object(vec![
                ("fmsVer".into(), Amf0Value::String("FMS/3,5,3,888".into())),
                ("capabilities".into(), Amf0Value::Number(127.0)),
                ("mode".into(), Amf0Value::Number(1.0)),
            ]),
            Amf0Value::Object(vec![
                ("level".into(), Amf0Value::String("status".into())),
                (
                    "code".into(),
                    Amf0Value::String("NetConnection.Connect.Success".into()),
                ),
                (
                    "description".into(),
                    Amf0Value::String("Connection succeeded".into()),
                ),
                ("objectEncoding".into(), Amf0Value::Number(0.0)),
            ]),
        ],
    )
}

/// Builds the `_result` reply to `createStream`.
pub fn create_stream_result(transaction_id: f64, stream_id: u32) -> RtmpMessage {
    RtmpMessage::command(
        0,
        &[
            Amf0Value::String("_result".into()),
            Amf0Value::Number(transaction_id),
            Amf0Value::Null,
            Amf0Value::Number(stream_id as f64),
        ],
    )
}

/// Builds an `onStatus` notification on a stream.
pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> RtmpMessage {
    RtmpMessage::command(
        stream_id,
        &[
            Amf0Value::String("onStatus".into()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(vec![
                ("level".into(), Amf0Value::String(level.into())),
                ("code".into(), Amf0Value::String(code.into())),
                ("description".into(), Amf0Value::String(description.into())),
            ]),
        ],
    )
}

/// Builds the RTMP 302 redirect carried in an `onStatus` error, used to
/// bounce clients to the origin cluster.
pub fn redirect_status(stream_id: u32, redirect_url: &str) -> RtmpMessage {
    RtmpMessage::command(
        stream_id,
        &[
            Amf0Value::String("onStatus".into()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(vec![
                ("level".into(), Amf0Value::String("error".into())),
                (
                    "code".into(),
                    Amf0Value::String("NetConnection.Connect.Rejected".into()),
                ),
                (
                    "description".into(),
                    Amf0Value::String(format!("RTMP 302 Redirect to {redirect_url}")),
                ),
                ("ex".into(), Amf0Value::Object(vec![
                    ("code".into(), Amf0Value::Number(302.0)),
                    ("redirect".into(), Amf0Value::String(redirect_url.into())),
                ])),
            ]),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_command() {
        let msg = RtmpMessage::command(
            0,
            &[
                Amf0Value::String("connect".into()),
                Amf0Value::Number(1.0),
                Amf0Value::Object(vec![(
                    "app".into(),
                    Amf0Value::String("live".into()),
                )]),
            ],
        );
        let cmd = msg.parse_command().unwrap();
        assert_eq!(cmd.name, "connect");
        assert_eq!(cmd.transaction_id, 1.0);
        assert_eq!(
            cmd.arguments[0].get("app").and_then(|v| v.as_str()),
            Some("live")
        );
    }

    #[test]
    fn test_parse_publish_stream_name() {
        let msg = RtmpMessage::command(
            1,
            &[
                Amf0Value::String("publish".into()),
                Amf0Value::Number(5.0),
                Amf0Value::Null,
                Amf0Value::String("livestream?token=x".into()),
                Amf0Value::String("live".into()),
            ],
        );
        let cmd = msg.parse_command().unwrap();
        assert_eq!(cmd.name, "publish");
        assert_eq!(cmd.stream_name(), Some("livestream?token=x"));
    }

    #[test]
    fn test_user_control_round_trip() {
        let msg = RtmpMessage::user_control(USER_CONTROL_STREAM_BEGIN, 1);
        assert_eq!(msg.parse_user_control().unwrap(), (0, 1));
    }

    #[test]
    fn test_on_status_shape() {
        let msg = on_status(1, "status", "NetStream.Publish.Start", "ok");
        let cmd = msg.parse_command().unwrap();
        assert_eq!(cmd.name, "onStatus");
        let info = &cmd.arguments[1];
        assert_eq!(
            info.get("code").and_then(|v| v.as_str()),
            Some("NetStream.Publish.Start")
        );
    }

    #[test]
    fn test_redirect_carries_url() {
        let msg = redirect_status(1, "rtmp://origin:1935/live/cam");
        let cmd = msg.parse_command().unwrap();
        let ex = cmd.arguments[1].get("ex").unwrap();
        assert_eq!(
            ex.get("redirect").and_then(|v| v.as_str()),
            Some("rtmp://origin:1935/live/cam")
        );
    }
}
