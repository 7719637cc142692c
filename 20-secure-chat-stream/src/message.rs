use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChatError;

/// Sender id reserved for synthetic liveness messages.
pub const HEARTBEAT_SENDER: &str = "heartbeat";

/// Longest line accepted from the wire, terminator included.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One chat unit as it travels on the wire. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    sender_id: String,
    content: String,
    timestamp_millis: i64,
}

impl ChatMessage {
    /// Builds a user message stamped with the current wall-clock time.
    pub fn new(sender_id: impl Into<String>, content: impl Into<String>) -> Result<Self, ChatError> {
        Self::with_timestamp(sender_id, content, now_millis())
    }

    /// Builds a user message with an explicit producer timestamp.
    pub fn with_timestamp(
        sender_id: impl Into<String>,
        content: impl Into<String>,
        timestamp_millis: i64,
    ) -> Result<Self, ChatError> {
        let sender_id = sender_id.into();
        if sender_id == HEARTBEAT_SENDER {
            return Err(ChatError::ReservedSenderId);
        }
        Ok(Self {
            sender_id,
            content: content.into(),
            timestamp_millis,
        })
    }

    pub fn heartbeat() -> Self {
        Self {
            sender_id: HEARTBEAT_SENDER.to_string(),
            content: HEARTBEAT_SENDER.to_string(),
            timestamp_millis: now_millis(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    pub fn is_heartbeat(&self) -> bool {
        self.sender_id == HEARTBEAT_SENDER
    }

    /// Whether user-facing output may show this message.
    pub fn is_displayable(&self) -> bool {
        !self.is_heartbeat()
    }
}

/// Everything that can appear on one line of the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Message(ChatMessage),
    /// Sender gave up on the stream; the receiver treats it as a receive-path error.
    Abort { reason: String },
}

/// Encodes a frame as one newline-terminated JSON line.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ChatError> {
    let mut encoded = serde_json::to_vec(frame)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decodes one line, with or without its terminator.
pub fn decode(line: &[u8]) -> Result<Frame, ChatError> {
    let text = std::str::from_utf8(line)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(serde_json::from_str(text.trim_end_matches(LINE_ENDINGS))?)
}

/// Reads the next frame, skipping blank lines. `None` at end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ChatError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut limited = (&mut *reader).take(MAX_FRAME_LENGTH as u64);
        let bytes = limited.read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == MAX_FRAME_LENGTH && line.last() != Some(&b'\n') {
            return Err(ChatError::FrameTooLarge {
                limit: MAX_FRAME_LENGTH,
            });
        }

        if line.iter().all(|byte| matches!(byte, b'\n' | b'\r')) {
            continue;
        }
        return decode(&line).map(Some);
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
{
    // A frame is written whole and flushed before the next one starts.
    writer.write_all(&encode(frame)?).await?;
    writer.flush().await?;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
