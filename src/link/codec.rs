use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Splits the raw serial byte stream into newline-delimited records.
///
/// Decoding yields the bytes before each `\n`, with a trailing `\r`
/// stripped. Encoding writes bytes as-is; whether a terminator is wanted is
/// decided before a write is queued (text writes carry one, hex and binary
/// writes never do).
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordCodec {
    /// How far we have already scanned for a delimiter into the buffer.
    cursor: usize,
}

impl Decoder for RecordCodec {
    type Item = Vec<u8>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scanned_to = src.len();
        let look_at = &src[self.cursor..scanned_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == b'\n') {
            // We might have started scanning late (from the cursor), so the
            // position within the whole buffer has to be adjusted.
            let actual_position = self.cursor + position;
            self.cursor = 0;

            let mut record = src.split_to(actual_position);
            if record.last() == Some(&b'\r') {
                record.truncate(record.len() - 1);
            }

            // Discard the newline itself.
            src.advance(1);

            Ok(Some(record[..].to_vec()))
        } else {
            // No full record yet. The same buffer comes back next call,
            // possibly with more data; no need to rescan what we have
            // already looked at.
            self.cursor = scanned_to;
            Ok(None)
        }
    }
}

impl Encoder<Vec<u8>> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_records_on_newlines() {
        let mut codec = RecordCodec::default();
        let mut buffer = BytesMut::from(&b"one\ntwo\n"[..]);

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(b"one".to_vec()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(b"two".to_vec()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut codec = RecordCodec::default();
        let mut buffer = BytesMut::from(&b"boot ok\r\n"[..]);

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(b"boot ok".to_vec()));
    }

    #[test]
    fn record_split_across_reads() {
        let mut codec = RecordCodec::default();
        let mut buffer = BytesMut::from(&b"hel"[..]);

        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"lo\nrest");
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(&buffer[..], b"rest");
    }

    #[test]
    fn encodes_bytes_unchanged() {
        let mut codec = RecordCodec::default();
        let mut out = BytesMut::new();

        codec.encode(b"raw \xff bytes".to_vec(), &mut out).unwrap();
        assert_eq!(&out[..], b"raw \xff bytes");
    }
}
