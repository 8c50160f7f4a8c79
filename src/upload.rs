//! Uploaded image validation and header inspection.
//!
//! Nothing here decodes pixels. Formats are identified from magic bytes via
//! `infer`, and the container headers are walked only far enough to read
//! the declared dimensions and any embedded text (PNG text chunks, JPEG
//! comments, GIF comment extensions) for the safety gate.

use axum::body::Bytes;
use memchr::memchr;

use crate::error::TitleError;

/// Upper bound on extracted text per upload.
const MAX_TEXT_SIGNAL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
}

impl ImageFormat {
    pub const ALLOWED: [ImageFormat; 3] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Gif];

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        Self::ALLOWED
            .into_iter()
            .find(|f| f.mime_type().eq_ignore_ascii_case(essence))
    }

    /// Identify the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        infer::get(bytes).and_then(|kind| Self::from_mime(kind.mime_type()))
    }
}

/// A validated upload: declared and sniffed types are both allowed.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub filename: String,
    pub format: ImageFormat,
    pub bytes: Bytes,
}

impl ImageUpload {
    pub fn validate(
        filename: Option<&str>,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<Self, TitleError> {
        let declared = content_type
            .and_then(ImageFormat::from_mime)
            .ok_or_else(|| {
                TitleError::UnsupportedFormat(format!(
                    "File must be a JPEG, PNG or GIF image (got {})",
                    content_type.unwrap_or("no content type")
                ))
            })?;
        let format = ImageFormat::sniff(&bytes).ok_or_else(|| {
            TitleError::UnsupportedFormat(
                "File content is not a valid JPEG, PNG or GIF image".to_string(),
            )
        })?;
        if format != declared {
            tracing::debug!(
                declared = declared.mime_type(),
                sniffed = format.mime_type(),
                "declared content type differs from file content"
            );
        }
        Ok(Self {
            filename: filename.unwrap_or("upload").to_string(),
            format,
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Width and height declared by the image header.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.format {
            ImageFormat::Png => png_dimensions(&self.bytes),
            ImageFormat::Gif => gif_dimensions(&self.bytes),
            ImageFormat::Jpeg => {
                let mut dims = None;
                walk_jpeg(&self.bytes, |marker, payload| {
                    if is_sof(marker) && payload.len() >= 5 {
                        let h = u16::from_be_bytes([payload[1], payload[2]]) as u32;
                        let w = u16::from_be_bytes([payload[3], payload[4]]) as u32;
                        dims = Some((w, h));
                        return false;
                    }
                    true
                });
                dims
            }
        }
    }

    /// Text the safety gate can inspect: the file name plus embedded
    /// metadata text, one entry per source.
    pub fn text_signals(&self) -> Vec<String> {
        let mut out = vec![self.filename.clone()];
        let mut budget = MAX_TEXT_SIGNAL_BYTES;
        let mut push = |raw: &[u8]| {
            if budget == 0 || raw.is_empty() {
                return budget > 0;
            }
            let take = raw.len().min(budget);
            budget -= take;
            out.push(String::from_utf8_lossy(&raw[..take]).into_owned());
            budget > 0
        };
        match self.format {
            ImageFormat::Png => png_text(&self.bytes, &mut push),
            ImageFormat::Jpeg => walk_jpeg(&self.bytes, |marker, payload| {
                if marker == 0xFE {
                    return push(payload);
                }
                true
            }),
            ImageFormat::Gif => gif_comments(&self.bytes, &mut push),
        }
        out
    }
}

fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn png_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < 24 || &b[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes([b[16], b[17], b[18], b[19]]);
    let h = u32::from_be_bytes([b[20], b[21], b[22], b[23]]);
    Some((w, h))
}

fn png_text(b: &[u8], push: &mut dyn FnMut(&[u8]) -> bool) {
    let mut pos = 8;
    while pos + 8 <= b.len() {
        let len = u32::from_be_bytes([b[pos], b[pos + 1], b[pos + 2], b[pos + 3]]) as usize;
        let kind = &b[pos + 4..pos + 8];
        let start = pos + 8;
        let Some(end) = start.checked_add(len).filter(|e| *e <= b.len()) else {
            return;
        };
        let data = &b[start..end];
        let keep_going = match kind {
            b"tEXt" => match memchr(0, data) {
                Some(nul) => push(&data[..nul]) && push(&data[nul + 1..]),
                None => push(data),
            },
            // keyword \0 flag method lang \0 translated \0 text
            b"iTXt" => match memchr(0, data) {
                Some(nul) if data.len() > nul + 2 && data[nul + 1] == 0 => {
                    let rest = &data[nul + 3..];
                    let after_lang = memchr(0, rest).map(|i| &rest[i + 1..]).unwrap_or(&[]);
                    let text = memchr(0, after_lang)
                        .map(|i| &after_lang[i + 1..])
                        .unwrap_or(&[]);
                    push(&data[..nul]) && push(text)
                }
                _ => true,
            },
            b"IEND" => return,
            _ => true,
        };
        if !keep_going {
            return;
        }
        // skip crc
        pos = end + 4;
    }
}

/// Visit JPEG marker segments up to the start of scan. The visitor returns
/// false to stop.
fn walk_jpeg(b: &[u8], mut visit: impl FnMut(u8, &[u8]) -> bool) {
    if b.len() < 4 || b[0] != 0xFF || b[1] != 0xD8 {
        return;
    }
    let mut pos = 2;
    while pos + 1 < b.len() {
        if b[pos] != 0xFF {
            return;
        }
        let marker = b[pos + 1];
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            0xD9 | 0xDA => return,
            _ => {}
        }
        if pos + 4 > b.len() {
            return;
        }
        let len = u16::from_be_bytes([b[pos + 2], b[pos + 3]]) as usize;
        if len < 2 || pos + 2 + len > b.len() {
            return;
        }
        if !visit(marker, &b[pos + 4..pos + 2 + len]) {
            return;
        }
        pos += 2 + len;
    }
}

fn gif_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < 10 {
        return None;
    }
    let w = u16::from_le_bytes([b[6], b[7]]) as u32;
    let h = u16::from_le_bytes([b[8], b[9]]) as u32;
    Some((w, h))
}

/// Skip a chain of GIF data sub-blocks starting at `pos`, feeding each block
/// to `sink` when provided. Returns the position after the terminator.
fn gif_sub_blocks(
    b: &[u8],
    mut pos: usize,
    mut sink: Option<&mut dyn FnMut(&[u8]) -> bool>,
) -> Option<usize> {
    loop {
        let size = *b.get(pos)? as usize;
        pos += 1;
        if size == 0 {
            return Some(pos);
        }
        let block = b.get(pos..pos + size)?;
        if let Some(sink) = sink.as_deref_mut() {
            if !sink(block) {
                return None;
            }
        }
        pos += size;
    }
}

fn color_table_len(packed: u8) -> usize {
    if packed & 0x80 != 0 {
        3 * (1usize << ((packed & 0x07) + 1))
    } else {
        0
    }
}

fn gif_comments(b: &[u8], push: &mut dyn FnMut(&[u8]) -> bool) {
    if b.len() < 13 {
        return;
    }
    let mut pos = 13 + color_table_len(b[10]);
    while let Some(&tag) = b.get(pos) {
        let next = match tag {
            0x21 => {
                let label = match b.get(pos + 1) {
                    Some(l) => *l,
                    None => return,
                };
                if label == 0xFE {
                    gif_sub_blocks(b, pos + 2, Some(&mut *push))
                } else {
                    gif_sub_blocks(b, pos + 2, None)
                }
            }
            0x2C => {
                let packed = match b.get(pos + 9) {
                    Some(p) => *p,
                    None => return,
                };
                // descriptor, local table, lzw code size byte
                let data_start = pos + 10 + color_table_len(packed) + 1;
                gif_sub_blocks(b, data_start, None)
            }
            _ => return,
        };
        match next {
            Some(n) => pos = n,
            None => return,
        }
    }
}
