//! IFF chunk container codec.
//!
//! Both Blorb resource files and Quetzal-style save files are IFF `FORM`s: a
//! 12-byte header (`FORM`, length, form type) followed by chunks of
//! `tag, length, payload` with odd payloads padded to an even byte count.

use crate::error::PersistenceError;

/// Four-character chunk tag.
pub type Tag = [u8; 4];

/// A borrowed chunk inside a parsed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub tag: Tag,
    /// Offset of the chunk header within the container.
    pub offset: usize,
    pub data: &'a [u8],
}

/// A parsed `FORM` container.
#[derive(Debug, Clone)]
pub struct Form<'a> {
    pub form_type: Tag,
    pub chunks: Vec<Chunk<'a>>,
}

impl<'a> Form<'a> {
    /// Parse a complete `FORM` from `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PersistenceError> {
        if bytes.len() < 12 || &bytes[0..4] != b"FORM" {
            return Err(PersistenceError::BadContainer("missing FORM header"));
        }
        let declared = read_u32(bytes, 4) as usize;
        let end = declared
            .checked_add(8)
            .filter(|&end| end <= bytes.len())
            .ok_or(PersistenceError::BadContainer("FORM length exceeds data"))?;
        let form_type = tag_at(bytes, 8);

        let mut chunks = Vec::new();
        let mut pos = 12;
        while pos + 8 <= end {
            let tag = tag_at(bytes, pos);
            let len = read_u32(bytes, pos + 4) as usize;
            let start = pos + 8;
            let stop = start
                .checked_add(len)
                .filter(|&stop| stop <= end)
                .ok_or(PersistenceError::BadContainer("chunk length exceeds FORM"))?;
            chunks.push(Chunk {
                tag,
                offset: pos,
                data: &bytes[start..stop],
            });
            pos = stop + (len & 1);
        }

        Ok(Form { form_type, chunks })
    }

    /// First chunk with the given tag.
    pub fn find(&self, tag: &Tag) -> Option<&Chunk<'a>> {
        self.chunks.iter().find(|chunk| &chunk.tag == tag)
    }

    /// First chunk with the given tag, or `MissingChunk`.
    pub fn require(&self, tag: &'static str) -> Result<&Chunk<'a>, PersistenceError> {
        let mut wanted = [b' '; 4];
        wanted.copy_from_slice(&tag.as_bytes()[..4]);
        self.find(&wanted).ok_or(PersistenceError::MissingChunk(tag))
    }
}

/// Incremental writer for a `FORM`.
#[derive(Debug)]
pub struct FormWriter {
    buf: Vec<u8>,
}

impl FormWriter {
    /// Start a new form of the given type.
    pub fn new(form_type: Tag) -> Self {
        let mut buf = Vec::with_capacity(1024);
        buf.extend_from_slice(b"FORM");
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&form_type);
        FormWriter { buf }
    }

    /// Append a chunk, padding odd payloads.
    pub fn chunk(&mut self, tag: Tag, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&tag);
        self.buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(data);
        if data.len() & 1 == 1 {
            self.buf.push(0);
        }
        self
    }

    /// Patch the form length and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = (self.buf.len() - 8) as u32;
        self.buf[4..8].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[inline]
fn tag_at(bytes: &[u8], offset: usize) -> Tag {
    [bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_pads_odd_chunks() {
        let mut writer = FormWriter::new(*b"TEST");
        writer.chunk(*b"ODD ", &[1, 2, 3]).chunk(*b"EVEN", &[4, 5]);
        let bytes = writer.finish();

        // 12 header + (8 + 3 + 1 pad) + (8 + 2)
        assert_eq!(bytes.len(), 12 + 12 + 10);
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);

        let form = Form::parse(&bytes).unwrap();
        assert_eq!(&form.form_type, b"TEST");
        assert_eq!(form.chunks.len(), 2);
        assert_eq!(form.find(b"ODD ").unwrap().data, &[1, 2, 3]);
        assert_eq!(form.find(b"EVEN").unwrap().data, &[4, 5]);
    }

    #[test]
    fn test_require_reports_missing_chunk() {
        let bytes = FormWriter::new(*b"TEST").finish();
        let form = Form::parse(&bytes).unwrap();
        assert_eq!(
            form.require("CMem").unwrap_err(),
            PersistenceError::MissingChunk("CMem")
        );
    }

    #[test]
    fn test_rejects_truncated_form() {
        let mut bytes = FormWriter::new(*b"TEST").finish();
        bytes[7] = 200;
        assert!(matches!(
            Form::parse(&bytes),
            Err(PersistenceError::BadContainer(_))
        ));
        assert!(Form::parse(b"JUNK").is_err());
    }
}
