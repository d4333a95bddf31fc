//! Wire framing for the beanstalkd text protocol.
//!
//! Replies are CRLF-terminated status lines. `RESERVED`, `FOUND` and `OK`
//! announce a data block by their last token; the decoder holds the parsed
//! status line until the whole block and its trailing CRLF have arrived, so
//! frames split across reads of any size reassemble correctly.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::QueueError;
use crate::protocol::{Command, Reply, PAYLOAD_REPLIES};

const CRLF: &[u8] = b"\r\n";

/// Upper bound on a status line; anything longer is a broken peer.
const MAX_LINE_LEN: usize = 1024;

/// Upper bound on an announced data block. beanstalkd refuses to raise
/// `max-job-size` past 1 GiB, so no honest reply carries more.
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

#[derive(Debug, Default)]
pub struct BeanstalkCodec {
    /// Status line of a payload reply whose data block is incomplete.
    awaiting: Option<(Vec<String>, usize)>,
}

impl BeanstalkCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BeanstalkCodec {
    type Item = Reply;
    type Error = QueueError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, QueueError> {
        if self.awaiting.is_none() {
            let Some(end) = src.windows(CRLF.len()).position(|w| w == CRLF) else {
                if src.len() > MAX_LINE_LEN {
                    return Err(QueueError::Malformed(format!(
                        "status line exceeds {MAX_LINE_LEN} bytes"
                    )));
                }
                return Ok(None);
            };

            let line = src.split_to(end);
            src.advance(CRLF.len());
            let line = std::str::from_utf8(&line)
                .map_err(|e| QueueError::Malformed(format!("non-UTF-8 status line: {e}")))?;
            let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();

            let keyword = tokens.first().map(String::as_str).unwrap_or_default();
            if !PAYLOAD_REPLIES.contains(&keyword) {
                return Ok(Some(Reply {
                    tokens,
                    payload: None,
                }));
            }

            let len = tokens
                .last()
                .filter(|_| tokens.len() > 1)
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or_else(|| {
                    QueueError::Malformed(format!("{keyword} reply without data length: {line}"))
                })?;
            if len > MAX_PAYLOAD_LEN {
                return Err(QueueError::Malformed(format!(
                    "{keyword} data block of {len} bytes exceeds {MAX_PAYLOAD_LEN}"
                )));
            }
            self.awaiting = Some((tokens, len));
        }

        let Some((_, len)) = self.awaiting.as_ref() else {
            return Ok(None);
        };
        let len = *len;
        if src.len() < len + CRLF.len() {
            src.reserve(len + CRLF.len() - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        if &src[..CRLF.len()] != CRLF {
            return Err(QueueError::Malformed(
                "data block not terminated by CRLF".to_string(),
            ));
        }
        src.advance(CRLF.len());

        let tokens = self.awaiting.take().map(|(t, _)| t).unwrap_or_default();
        Ok(Some(Reply {
            tokens,
            payload: Some(payload),
        }))
    }
}

impl Encoder<Command> for BeanstalkCodec {
    type Error = QueueError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), QueueError> {
        let line = command.line();
        dst.reserve(line.len() + CRLF.len());
        dst.put_slice(line.as_bytes());
        dst.put_slice(CRLF);
        if let Command::Put { body, .. } = command {
            dst.reserve(body.len() + CRLF.len());
            dst.put_slice(&body);
            dst.put_slice(CRLF);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;

    fn decode_all(codec: &mut BeanstalkCodec, buf: &mut BytesMut) -> Vec<Reply> {
        let mut out = Vec::new();
        while let Some(reply) = codec.decode(buf).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn simple_status_lines() {
        let mut codec = BeanstalkCodec::new();
        let mut buf = BytesMut::from(&b"INSERTED 1\r\nDELETED\r\n"[..]);
        let replies = decode_all(&mut codec, &mut buf);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tokens, vec!["INSERTED", "1"]);
        assert_eq!(replies[1].keyword(), "DELETED");
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_reply_split_at_every_byte() {
        let wire = b"RESERVED 7 5\r\nhe\r\no\r\nTOUCHED\r\n";
        let mut codec = BeanstalkCodec::new();
        let mut buf = BytesMut::new();
        let mut replies = Vec::new();
        for byte in wire {
            buf.put_u8(*byte);
            replies.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tokens, vec!["RESERVED", "7", "5"]);
        assert_eq!(replies[0].payload, Some(Bytes::from_static(b"he\r\no")));
        assert_eq!(replies[1].keyword(), "TOUCHED");
    }

    #[test]
    fn empty_payload() {
        let mut codec = BeanstalkCodec::new();
        let mut buf = BytesMut::from(&b"OK 0\r\n\r\n"[..]);
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.payload, Some(Bytes::new()));
    }

    #[test]
    fn missing_length_is_malformed() {
        let mut codec = BeanstalkCodec::new();
        let mut buf = BytesMut::from(&b"FOUND\r\n"[..]);
        assert_matches!(codec.decode(&mut buf), Err(QueueError::Malformed(_)));
    }

    #[test]
    fn oversized_data_length_is_malformed() {
        let mut codec = BeanstalkCodec::new();
        let line = format!("RESERVED 1 {}\r\n", usize::MAX);
        let mut buf = BytesMut::from(line.as_bytes());
        assert_matches!(codec.decode(&mut buf), Err(QueueError::Malformed(_)));

        let mut codec = BeanstalkCodec::new();
        let line = format!("OK {}\r\n", MAX_PAYLOAD_LEN + 1);
        let mut buf = BytesMut::from(line.as_bytes());
        assert_matches!(codec.decode(&mut buf), Err(QueueError::Malformed(_)));
        assert!(buf.capacity() < MAX_PAYLOAD_LEN);
    }

    #[test]
    fn bad_terminator_is_malformed() {
        let mut codec = BeanstalkCodec::new();
        let mut buf = BytesMut::from(&b"OK 2\r\nabXY"[..]);
        assert_matches!(codec.decode(&mut buf), Err(QueueError::Malformed(_)));
    }

    #[test]
    fn put_is_framed_with_body() {
        let mut codec = BeanstalkCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(
                Command::Put {
                    pri: 0,
                    delay: 0,
                    ttr: 60,
                    body: Bytes::from_static(b"{}"),
                },
                &mut dst,
            )
            .unwrap();
        codec.encode(Command::Reserve, &mut dst).unwrap();
        assert_eq!(&dst[..], b"put 0 0 60 2\r\n{}\r\nreserve\r\n");
    }
}
