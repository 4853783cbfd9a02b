use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest line accepted from a peer, without its terminator.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Newline-delimited text. Bytes that are not UTF-8 are replaced rather than rejected and
/// lines longer than the limit are skipped up to their newline, so neither ends the stream.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        LineCodec::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        LineCodec { max_length, discarding: false }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        LineCodec::new()
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, source: &mut BytesMut) -> std::io::Result<Option<Self::Item>> {
        while let Some(index) = source.iter().position(|&byte| byte == b'\n') {
            let line = source.split_to(index + 1);
            if self.discarding || index > self.max_length {
                log::warn!("Dropping line longer than {} bytes", self.max_length);
                self.discarding = false;
                continue;
            }
            return Ok(Some(to_line(&line[..index])));
        }
        /* no terminator yet, keep at most one line in memory */
        if source.len() > self.max_length {
            self.discarding = true;
            source.advance(source.len());
        }
        Ok(None)
    }

    fn decode_eof(&mut self, source: &mut BytesMut) -> std::io::Result<Option<Self::Item>> {
        if let Some(line) = self.decode(source)? {
            return Ok(Some(line));
        }
        if source.is_empty() || self.discarding {
            source.clear();
            return Ok(None);
        }
        let line = source.split_to(source.len());
        Ok(Some(to_line(&line)))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: T, destination: &mut BytesMut) -> std::io::Result<()> {
        let line = line.as_ref();
        destination.reserve(line.len() + 1);
        destination.put_slice(line.as_bytes());
        destination.put_u8(b'\n');
        Ok(())
    }
}
