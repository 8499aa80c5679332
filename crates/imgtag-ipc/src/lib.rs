//! Line-delimited JSON framing for the subprocess wire protocol: one `Message` per `\n`-terminated line on a child's stdin
//! and stdout.

use imgtag_core::Tag;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// A single record of the subprocess protocol. All fields are optional on
/// the wire; exactly one of `tags`/`error` is populated on a reply, `url`
/// on a request, `shutdown` on the parent's teardown signal.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,
}

impl Message {
    pub fn request(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn reply_tags(tags: Vec<Tag>) -> Self {
        Self {
            tags: Some(tags),
            ..Default::default()
        }
    }

    pub fn reply_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn shutdown() -> Self {
        Self {
            shutdown: Some(true),
            ..Default::default()
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.unwrap_or(false)
    }
}

/// Reads `Message`s off an `AsyncBufRead`, one per line. Lines that fail to
/// parse are logged and skipped rather than treated as an error, since the
/// same stream may interleave free-form subprocess log output.
pub struct MessageDecoder<R> {
    reader: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> MessageDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Returns the next well-formed message, or `Ok(None)` on clean EOF.
    /// Any I/O error other than EOF propagates.
    pub async fn next(&mut self) -> anyhow::Result<Option<Message>> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Message>(trimmed) {
                Ok(message) => {
                    imgtag_core::verbose!("decoded ipc frame: {trimmed}");
                    return Ok(Some(message));
                }
                Err(err) => {
                    log::warn!("skipping unparseable ipc line: {err} ({trimmed:?})");
                    continue;
                }
            }
        }
    }
}

/// Writes `Message`s to an `AsyncWrite`, one `\n`-terminated JSON line per
/// call.
pub struct MessageEncoder<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write(&mut self, message: &Message) -> anyhow::Result<()> {
        let mut data = serde_json::to_vec(message)?;
        data.push(b'\n');

        match self.writer.write_all(&data).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn decode_all(data: &str) -> Vec<Message> {
        let mut decoder = MessageDecoder::new(Cursor::new(data.as_bytes().to_vec()));
        let mut out = Vec::new();
        while let Some(message) = decoder.next().await.unwrap() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn round_trips_a_request() {
        let mut buf = Vec::new();
        let message = Message::request("http://x/1.jpg");
        MessageEncoder::new(&mut buf).write(&message).await.unwrap();

        let decoded = decode_all(std::str::from_utf8(&buf).unwrap()).await;
        assert_eq!(decoded, vec![message]);
    }

    #[tokio::test]
    async fn round_trips_a_tagged_reply() {
        let mut buf = Vec::new();
        let message = Message::reply_tags(vec![Tag {
            name: "cat".into(),
            score: 0.9,
        }]);
        MessageEncoder::new(&mut buf).write(&message).await.unwrap();

        let decoded = decode_all(std::str::from_utf8(&buf).unwrap()).await;
        assert_eq!(decoded, vec![message]);
    }

    #[tokio::test]
    async fn tolerant_decode_skips_garbage_lines() {
        let mut buf = Vec::new();
        let m1 = Message::request("http://x/1.jpg");
        let m2 = Message::reply_tags(vec![]);
        MessageEncoder::new(&mut buf).write(&m1).await.unwrap();
        buf.extend_from_slice(b"not json at all, a stack trace maybe\n");
        MessageEncoder::new(&mut buf).write(&m2).await.unwrap();

        let decoded = decode_all(std::str::from_utf8(&buf).unwrap()).await;
        assert_eq!(decoded, vec![m1, m2]);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut decoder = MessageDecoder::new(Cursor::new(Vec::<u8>::new()));
        assert!(decoder.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_message_round_trips() {
        let mut buf = Vec::new();
        let message = Message::shutdown();
        MessageEncoder::new(&mut buf).write(&message).await.unwrap();

        let decoded = decode_all(std::str::from_utf8(&buf).unwrap()).await;
        assert_eq!(decoded, vec![message]);
        assert!(decoded[0].is_shutdown());
    }
}
