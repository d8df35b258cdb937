//! Wire format of helper streams.
//!
//! All helper traffic between two peers shares one QUIC connection
//! negotiated with a single ALPN ([`ALPN`]). Protocols are told apart at the
//! application layer instead of with one ALPN each, so talking several
//! protocols to a peer costs one TLS handshake, not one per protocol.
//!
//! ```text
//! Connection between two helpers
//!     ├── bi stream:  {"kind":"stream","protocol":"/mina/97"}\n  ◄── ack\n  ... bytes ...
//!     ├── bi stream:  {"kind":"stream","protocol":"/other/1"}\n  ◄── ack\n  ... bytes ...
//!     └── uni stream: {"kind":"gossip","topic":"test"}\n  payload
//! ```
//!
//! ## Streams
//!
//! 1. The opener starts a bidirectional stream and sends a JSON
//!    [`StreamHeader::Stream`] line.
//! 2. The acceptor answers with an [`ACK`] line once its helper took the
//!    stream, or resets the stream when nobody handles the protocol.
//! 3. After that both directions carry raw bytes. A graceful finish reads as
//!    end of stream on the other side; anything else is a reset.
//!
//! ## Gossip
//!
//! Every published message goes on its own unidirectional stream to every
//! connected peer: one [`StreamHeader::Gossip`] line, then the payload up to
//! the end of the stream. Receivers drop messages for topics they did not
//! join.

/// ALPN of every helper connection.
pub const ALPN: &[u8] = b"/fastn/helper/0.1";

/// Line the acceptor sends once it accepted a stream.
pub const ACK: &str = "ack";

/// Upper bound for a header line, including the ack.
pub const MAX_HEADER_LEN: usize = 4 * 1024;

/// Upper bound for a gossip message, header included.
pub const MAX_GOSSIP_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamHeader {
    Stream { protocol: String },
    Gossip { topic: String },
}

impl StreamHeader {
    /// The header as a newline terminated line.
    pub fn to_line(&self) -> eyre::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> eyre::Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Builds a gossip frame: header line followed by the payload.
pub fn gossip_frame(topic: &str, data: &[u8]) -> eyre::Result<Vec<u8>> {
    let header = StreamHeader::Gossip {
        topic: topic.to_string(),
    }
    .to_line()?;
    let mut frame = Vec::with_capacity(header.len() + data.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Splits a gossip frame back into topic and payload.
pub fn parse_gossip_frame(frame: &[u8]) -> eyre::Result<(String, bytes::Bytes)> {
    let newline = frame
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| eyre::eyre!("gossip frame without header"))?;
    let header = std::str::from_utf8(&frame[..newline])?;
    match StreamHeader::from_line(header)? {
        StreamHeader::Gossip { topic } => Ok((
            topic,
            bytes::Bytes::copy_from_slice(&frame[newline + 1..]),
        )),
        other => Err(eyre::eyre!("expected gossip header, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_line() {
        let header = StreamHeader::Stream {
            protocol: "/mina/97".to_string(),
        };
        let line = header.to_line().unwrap();
        assert_eq!(line, "{\"kind\":\"stream\",\"protocol\":\"/mina/97\"}\n");
        assert_eq!(StreamHeader::from_line(&line).unwrap(), header);
    }

    #[test]
    fn test_gossip_frame_keeps_payload_bytes() {
        let frame = gossip_frame("test", b"bla-bla\nmore").unwrap();
        let (topic, data) = parse_gossip_frame(&frame).unwrap();
        assert_eq!(topic, "test");
        assert_eq!(&data[..], b"bla-bla\nmore");
    }

    #[test]
    fn test_gossip_frame_needs_gossip_header() {
        let mut frame = StreamHeader::Stream {
            protocol: "p".into(),
        }
        .to_line()
        .unwrap()
        .into_bytes();
        frame.extend_from_slice(b"x");
        assert!(parse_gossip_frame(&frame).is_err());
        assert!(parse_gossip_frame(b"no newline").is_err());
    }
}
