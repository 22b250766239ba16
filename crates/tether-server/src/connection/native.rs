//! Raw stream carrier.
//!
//! Any duplex byte stream works: an upgraded HTTP connection on either side,
//! or an in-memory pipe in tests. Inbound bytes are cut into lines by
//! [`LineCodec`]; outbound frames are written as whole lines.

use std::io;

use bytes::BytesMut;
use futures::StreamExt;
use tether_core::ConnectionError;
use tether_core::codec::{self, Frame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};

use super::{Connection, ConnectionKind, ConnectionState};

/// Splits a byte stream after each `\n`.
///
/// Lines keep their terminator and are decoded as lossy UTF-8. A multi-byte
/// character never contains `\n`, so cutting there never splits one.
#[derive(Debug, Default)]
pub(crate) struct LineCodec {
    next_index: usize,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match buf[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.next_index + offset + 1;
                self.next_index = 0;
                let line = buf.split_to(end);
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let line = self.decode(buf)?;
        if line.is_none() {
            // an unterminated tail can never become a frame
            buf.clear();
            self.next_index = 0;
        }
        Ok(line)
    }
}

impl Connection {
    /// Wrap an already-established duplex stream. Opens immediately.
    pub fn native<S>(stream: S, protocol: Option<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, outbound) = Self::build(ConnectionKind::Native, protocol, ConnectionState::Open);
        drop(tokio::spawn(drive(conn.clone(), stream, outbound)));
        conn
    }
}

async fn drive<S>(conn: Connection, stream: S, mut outbound: mpsc::UnboundedReceiver<Frame>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LineCodec::default());

    let error = loop {
        tokio::select! {
            () = conn.cancelled() => break None,
            line = lines.next() => match line {
                Some(Ok(line)) => conn.receive_text(&line),
                Some(Err(err)) => break Some(ConnectionError::from(err)),
                None => break None,
            },
            Some(frame) = outbound.recv() => {
                if let Err(err) = writer.write_all(codec::encode(&frame).as_bytes()).await {
                    break Some(err.into());
                }
            }
        }
    };

    let _ = writer.shutdown().await;
    let _ = conn.close(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_core::FrameKind;
    use tokio::io::AsyncReadExt;

    #[test]
    fn codec_splits_lines_and_keeps_tail() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"one\r\ntwo\nthr"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("one\r\n"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("two\n"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ee\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("three\n"));
    }

    #[test]
    fn codec_is_lossy_on_bad_utf8() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\xff\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("\u{fffd}\n")
        );
    }

    #[test]
    fn codec_drops_unterminated_tail_at_eof() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn writes_newline_delimited_frames() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = Connection::native(local, Some("ipc".into()));
        assert_eq!(conn.protocol(), Some("ipc"));
        assert!(conn.send(FrameKind::Message, json!([1, {"project": "a"}])));

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"[\"message\",[1,{\"project\":\"a\"}]]\n");
    }

    #[tokio::test]
    async fn garbage_lines_do_not_close() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let conn = Connection::native(local, None);
        let mut inbox = conn.subscribe();
        remote
            .write_all(b"garbage\n{\"x\":1}\n[\"message\",\"ok\"]\n")
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.body, json!("ok"));
        assert!(conn.is_open());
    }
}
