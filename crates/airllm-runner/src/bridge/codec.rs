//! Decoder for a stream of concatenated JSON objects.
//!
//! The worker writes one JSON object per chunk with no delimiter, and
//! transport chunking does not line up with object boundaries. This decoder
//! pulls one complete value at a time and waits for more bytes when the
//! buffer ends mid-object. Whitespace between values is skipped.

use std::io;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

pub struct ConcatJsonCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for ConcatJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcatJsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for ConcatJsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(start) = src.iter().position(|b| !b.is_ascii_whitespace()) else {
            src.clear();
            return Ok(None);
        };
        src.advance(start);

        let mut values = serde_json::Deserializer::from_slice(&src[..]).into_iter::<T>();
        match values.next() {
            Some(Ok(item)) => {
                let consumed = values.byte_offset();
                src.advance(consumed);
                tracing::trace!(bytes = consumed, "Decoded worker object");
                Ok(Some(item))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde::Deserialize;
    use tokio_util::codec::FramedRead;
    use tokio_util::io::StreamReader;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Chunk {
        content: String,
        #[serde(default)]
        done: bool,
    }

    fn chunk(content: &str, done: bool) -> Chunk {
        Chunk {
            content: content.to_string(),
            done,
        }
    }

    #[test]
    fn decodes_back_to_back_objects() {
        let mut codec = ConcatJsonCodec::<Chunk>::new();
        let mut buf = BytesMut::from(&br#"{"content":"a"}{"content":"b","done":true}"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk("a", false)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk("b", true)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_whitespace_between_objects() {
        let mut codec = ConcatJsonCodec::<Chunk>::new();
        let mut buf = BytesMut::from(&b"\n  {\"content\":\"a\"}\r\n\t{\"content\":\"b\"}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk("a", false)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk("b", false)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_rest_of_partial_object() {
        let mut codec = ConcatJsonCodec::<Chunk>::new();
        let mut buf = BytesMut::from(&br#"{"content":"hel"#[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(!buf.is_empty());

        buf.extend_from_slice(br#"lo"}"#);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk("hello", false)));
    }

    #[test]
    fn rejects_malformed_input() {
        let mut codec = ConcatJsonCodec::<Chunk>::new();
        let mut buf = BytesMut::from(&b"not json"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_wrong_shape() {
        let mut codec = ConcatJsonCodec::<Chunk>::new();
        let mut buf = BytesMut::from(&br#"{"content":42}"#[..]);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn framed_read_reassembles_split_chunks() {
        let pieces: Vec<io::Result<&'static [u8]>> = vec![
            Ok(br#"{"cont"#.as_slice()),
            Ok(br#"ent":"The"}{"content":" sky"#.as_slice()),
            Ok(br#""}"#.as_slice()),
            Ok(br#"{"content":"","done":true}"#.as_slice()),
        ];
        let reader = StreamReader::new(futures::stream::iter(pieces));
        let decoded: Vec<Chunk> = FramedRead::new(reader, ConcatJsonCodec::<Chunk>::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            decoded,
            vec![chunk("The", false), chunk(" sky", false), chunk("", true)]
        );
    }

    #[tokio::test]
    async fn framed_read_errors_on_truncated_tail() {
        let pieces: Vec<io::Result<&'static [u8]>> =
            vec![Ok(br#"{"content":"a"}"#.as_slice()), Ok(br#"{"content":"b"#.as_slice())];
        let reader = StreamReader::new(futures::stream::iter(pieces));
        let mut framed = FramedRead::new(reader, ConcatJsonCodec::<Chunk>::new());

        assert_eq!(framed.next().await.unwrap().unwrap(), chunk("a", false));
        assert!(framed.next().await.unwrap().is_err());
    }
}
