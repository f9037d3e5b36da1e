//! Game image extraction from Blorb resource files.
//!
//! A story may ship as a bare Glulx image or wrapped in a Blorb (`FORM` of
//! type `IFRS`). In the latter case the executable is the chunk referenced by
//! the resource index entry with usage `Exec`, and must be tagged `GLUL`.

use crate::error::{FatalError, Result};
use crate::header::{Header, GLULX_MAGIC};
use crate::iff::{read_u32, Form};

/// A story's Glulx image, unwrapped and with a validated header.
#[derive(Debug, Clone)]
pub struct GameImage {
    bytes: Vec<u8>,
    header: Header,
}

impl GameImage {
    /// Accept a bare image or a Blorb file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image = extract_image(bytes)?;
        let header = Header::parse(image)?;
        Ok(GameImage {
            bytes: image.to_vec(),
            header,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }
}

/// Return the Glulx image contained in `bytes`.
///
/// Bare images are returned unchanged; Blorb files are unwrapped.
pub fn extract_image(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() >= 4 && bytes[0..4] == GLULX_MAGIC {
        return Ok(bytes);
    }

    let form = Form::parse(bytes).map_err(|_| FatalError::BadHeader("not a Glulx image or Blorb file"))?;
    if &form.form_type != b"IFRS" {
        return Err(FatalError::BadHeader("IFF file is not a Blorb resource file"));
    }

    if let Some(index) = form.find(b"RIdx") {
        let data = index.data;
        if data.len() < 4 {
            return Err(FatalError::BadHeader("truncated Blorb resource index"));
        }
        let count = read_u32(data, 0) as usize;
        for entry in 0..count {
            let base = 4 + entry * 12;
            if base + 12 > data.len() {
                return Err(FatalError::BadHeader("truncated Blorb resource index"));
            }
            if &data[base..base + 4] != b"Exec" {
                continue;
            }
            let start = read_u32(data, base + 8) as usize;
            if let Some(chunk) = form.chunks.iter().find(|chunk| chunk.offset == start) {
                if &chunk.tag == b"GLUL" {
                    return Ok(chunk.data);
                }
                return Err(FatalError::BadHeader("Blorb executable is not a Glulx image"));
            }
        }
    }

    // Some tools omit the index; fall back to the first GLUL chunk.
    form.find(b"GLUL")
        .map(|chunk| chunk.data)
        .ok_or(FatalError::BadHeader("Blorb file contains no Glulx executable"))
}

// =============================================================================
// Tests
// =============================================================================
