//! Chunked blob codec.
//!
//! Files travel through the store as base64 data URLs
//! (`data:<mime>;base64,<payload>`). A data URL larger than a single record
//! should hold is sliced into string chunks at arbitrary character offsets;
//! reassembly concatenates them back before anything is decoded, so chunk
//! boundaries never need to line up with base64 groups.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use thiserror::Error;

use crate::structure::FileType;

/// Largest accepted upload, in raw bytes.
pub const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Chunk size used when splitting an encoded upload, in characters.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Decoded payloads are handed out in parts of this many bytes.
pub const DECODE_BLOCK_SIZE: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("corrupted file data: {0}")]
    CorruptPayload(String),

    #[error("no content stored for this resource")]
    ContentUnavailable,

    #[error("file size ({size} bytes) exceeds the 10MB platform limit")]
    TooLarge { size: u64 },
}

/// A decoded file: its mime type and its bytes in fixed-size parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime: String,
    pub parts: Vec<Bytes>,
}

impl Blob {
    pub fn len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        for part in &self.parts {
            bytes.extend_from_slice(part);
        }
        bytes
    }
}

pub fn check_size(size: u64) -> Result<(), CodecError> {
    if size > MAX_FILE_SIZE_BYTES {
        return Err(CodecError::TooLarge { size });
    }
    Ok(())
}

pub fn encode(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Slice `data_url` into pieces of at most `chunk_size` characters.
///
/// A chunk size of zero is treated as one. An empty input yields no chunks.
pub fn split(data_url: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data_url.len() / chunk_size + 1);
    let mut rest = data_url;

    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .nth(chunk_size)
            .map_or(rest.len(), |(offset, _)| offset);
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_string());
        rest = tail;
    }

    chunks
}

/// Concatenate chunks in the order they were stored.
pub fn reassemble<S: AsRef<str>>(chunks: &[S]) -> String {
    let mut data_url = String::with_capacity(chunks.iter().map(|c| c.as_ref().len()).sum());
    for chunk in chunks {
        data_url.push_str(chunk.as_ref());
    }
    data_url
}

pub fn decode(data_url: &str) -> Result<Blob, CodecError> {
    let (header, payload) = data_url
        .split_once(',')
        .ok_or_else(|| CodecError::CorruptPayload("missing ',' separator".to_string()))?;

    let mime = header
        .split_once(':')
        .map(|(_, rest)| rest.split(';').next().unwrap_or_default())
        .ok_or_else(|| CodecError::CorruptPayload("missing media type header".to_string()))?;

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CodecError::CorruptPayload(e.to_string()))?;

    let parts = bytes
        .chunks(DECODE_BLOCK_SIZE)
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(Blob {
        mime: mime.to_string(),
        parts,
    })
}

/// Name a downloaded file `<sanitized-title>.<extension>`.
pub fn download_name(title: &str, file_type: FileType) -> String {
    let safe_title: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();

    format!("{safe_title}.{}", file_type.extension())
}

/// Map an uploaded file name onto one of the repository's file types.
pub fn file_type_from_name(file_name: &str) -> FileType {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_uppercase())
        .unwrap_or_default();

    match extension.as_str() {
        "DOC" | "DOCX" => FileType::Doc,
        "PPT" | "PPTX" => FileType::Ppt,
        "ZIP" | "RAR" => FileType::Zip,
        "PNG" | "JPG" | "JPEG" | "GIF" => FileType::Img,
        _ => FileType::Pdf,
    }
}

pub fn human_size(size: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;

    if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else {
        format!("{:.1} MB", size as f64 / MIB)
    }
}

/// An upload that has been read, size-checked, encoded and chunked, ready to
/// be submitted as a file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDraft {
    pub file_name: String,
    pub file_type: FileType,
    pub file_size: String,
    pub file_size_bytes: u64,
    pub file_chunks: Vec<String>,
}

impl UploadDraft {
    pub fn prepare(file_name: &str, mime: &str, bytes: &[u8]) -> Result<Self, CodecError> {
        Self::prepare_with_chunk_size(file_name, mime, bytes, CHUNK_SIZE)
    }

    pub fn prepare_with_chunk_size(
        file_name: &str,
        mime: &str,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Result<Self, CodecError> {
        let file_size_bytes = bytes.len() as u64;
        check_size(file_size_bytes)?;

        let data_url = encode(bytes, mime);

        Ok(Self {
            file_name: file_name.to_string(),
            file_type: file_type_from_name(file_name),
            file_size: human_size(file_size_bytes),
            file_size_bytes,
            file_chunks: split(&data_url, chunk_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn encode_produces_data_url() {
        assert_eq!(encode(b"hi", "text/plain"), "data:text/plain;base64,aGk=");
    }

    #[test]
    fn round_trip_survives_any_chunk_size() {
        let bytes = sample_bytes(1500);
        let data_url = encode(&bytes, "application/pdf");

        for chunk_size in [1, 2, 3, 7, 64, 1000, data_url.len(), data_url.len() * 2] {
            let chunks = split(&data_url, chunk_size);
            let blob = decode(&reassemble(&chunks)).unwrap();
            assert_eq!(blob.mime, "application/pdf");
            assert_eq!(blob.to_vec(), bytes, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn round_trip_of_empty_file() {
        let data_url = encode(&[], "application/octet-stream");
        let blob = decode(&reassemble(&split(&data_url, 5))).unwrap();
        assert!(blob.is_empty());
        assert_eq!(blob.mime, "application/octet-stream");
    }

    #[test]
    fn split_respects_chunk_size() {
        let chunks = split("abcdefg", 3);
        assert_eq!(chunks, vec!["abc", "def", "g"]);
        assert!(split("", 3).is_empty());
        assert_eq!(split("ab", 0), vec!["a", "b"]);
    }

    #[test]
    fn decode_yields_fixed_size_parts() {
        let bytes = sample_bytes(DECODE_BLOCK_SIZE * 2 + 10);
        let blob = decode(&encode(&bytes, "image/png")).unwrap();
        let sizes: Vec<usize> = blob.parts.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![DECODE_BLOCK_SIZE, DECODE_BLOCK_SIZE, 10]);
    }

    #[test]
    fn reassembled_chunks_without_separator_are_corrupt() {
        let data_url = reassemble(&["abc", "def"]);
        assert_eq!(data_url, "abcdef");
        assert!(matches!(decode(&data_url), Err(CodecError::CorruptPayload(_))));
    }

    #[test]
    fn bad_header_and_bad_payload_are_corrupt() {
        assert!(matches!(
            decode("nonsense,aGk="),
            Err(CodecError::CorruptPayload(_))
        ));
        assert!(matches!(
            decode("data:text/plain;base64,@@@"),
            Err(CodecError::CorruptPayload(_))
        ));
    }

    #[test]
    fn download_names_are_sanitized() {
        assert_eq!(
            download_name("OS Unit-3 Notes!", FileType::Pdf),
            "os_unit_3_notes_.pdf"
        );
        assert_eq!(download_name("Slides", FileType::Ppt), "slides.pptx");
        assert_eq!(download_name("Deck", FileType::Doc), "deck.docx");
        assert_eq!(download_name("Lab", FileType::Zip), "lab.zip");
        assert_eq!(download_name("Diagram", FileType::Img), "diagram.png");
        assert_eq!(download_name("Misc", FileType::Other), "misc.txt");
    }

    #[test]
    fn extensions_map_to_file_types() {
        assert_eq!(file_type_from_name("notes.docx"), FileType::Doc);
        assert_eq!(file_type_from_name("deck.PPT"), FileType::Ppt);
        assert_eq!(file_type_from_name("src.rar"), FileType::Zip);
        assert_eq!(file_type_from_name("photo.jpeg"), FileType::Img);
        assert_eq!(file_type_from_name("README"), FileType::Pdf);
    }

    #[test]
    fn sizes_read_like_the_upload_form() {
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024 / 2), "1.5 MB");
    }

    #[test]
    fn size_cap_is_inclusive() {
        assert!(check_size(MAX_FILE_SIZE_BYTES).is_ok());
        assert_eq!(
            check_size(MAX_FILE_SIZE_BYTES + 1),
            Err(CodecError::TooLarge {
                size: MAX_FILE_SIZE_BYTES + 1
            })
        );
    }

    #[test]
    fn draft_prefers_chunks() {
        let bytes = sample_bytes(2048);
        let draft = UploadDraft::prepare_with_chunk_size("unit1.pdf", "application/pdf", &bytes, 1000)
            .unwrap();
        assert_eq!(draft.file_type, FileType::Pdf);
        assert_eq!(draft.file_size, "2.0 KB");
        assert_eq!(draft.file_size_bytes, 2048);
        assert!(draft.file_chunks.len() > 1);
        assert_eq!(decode(&reassemble(&draft.file_chunks)).unwrap().to_vec(), bytes);
    }
}
