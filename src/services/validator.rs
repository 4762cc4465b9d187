//! src/services/validator.rs
//!
//! Content admission gate. Decides whether an uploaded file may enter storage
//! by checking its extension against an allow-list and then classifying the
//! first bytes of the payload with magic-number detection. The client's
//! declared `Content-Type` is never consulted here.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, SeekFrom},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Number of leading bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 512;

/// Every media extension the service knows how to admit, paired with the
/// sniffed MIME types acceptable for it.
const MEDIA_TABLE: [(&str, &str); 7] = [
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".mp4", "video/mp4"),
    (".mov", "video/quicktime"),
    (".avi", "video/x-msvideo"),
    (".mkv", "video/x-matroska"),
];

const DEFAULT_UPLOAD_EXTENSIONS: [&str; 7] = [".jpg", ".jpeg", ".png", ".mp4", ".mov", ".avi", ".mkv"];
const DEFAULT_REPLACE_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".mp4"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported file extension `{0}`")]
    UnsupportedExtension(String),
    #[error("unsupported content type `{sniffed}` for extension `{extension}`")]
    UnsupportedContentType { extension: String, sniffed: String },
    #[error("unknown media extension `{0}` in admission policy")]
    UnknownPolicyExtension(String),
    #[error("could not read file content: {0}")]
    Unreadable(#[from] io::Error),
}

/// Outcome of a successful admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    /// Lowercase extension including the leading dot.
    pub extension: String,
    /// MIME type detected from the payload bytes.
    pub sniffed_type: &'static str,
}

/// Allow-list of extensions and, for each, the sniffed types it may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    allowed: BTreeMap<String, BTreeSet<&'static str>>,
}

impl AdmissionPolicy {
    /// Build a policy from a list of extensions. Each entry must appear in the
    /// built-in media table; a leading dot is optional and case is ignored.
    pub fn from_extensions<I, S>(extensions: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: BTreeMap<String, BTreeSet<&'static str>> = BTreeMap::new();
        for raw in extensions {
            let trimmed = raw.as_ref().trim().to_ascii_lowercase();
            if trimmed.is_empty() {
                continue;
            }
            let ext = if trimmed.starts_with('.') {
                trimmed
            } else {
                format!(".{trimmed}")
            };
            let types: BTreeSet<&'static str> = MEDIA_TABLE
                .iter()
                .filter(|(candidate, _)| *candidate == ext)
                .map(|(_, mime)| *mime)
                .collect();
            if types.is_empty() {
                return Err(ValidationError::UnknownPolicyExtension(ext));
            }
            allowed.entry(ext).or_default().extend(types);
        }
        Ok(Self { allowed })
    }

    /// Policy applied to new uploads: still images and common video containers.
    pub fn upload_default() -> Self {
        Self::from_extensions(DEFAULT_UPLOAD_EXTENSIONS).unwrap_or_else(|_| Self::empty())
    }

    /// Policy applied to replacements: a stricter subset of the upload policy.
    pub fn replace_default() -> Self {
        Self::from_extensions(DEFAULT_REPLACE_EXTENSIONS).unwrap_or_else(|_| Self::empty())
    }

    fn empty() -> Self {
        Self {
            allowed: BTreeMap::new(),
        }
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.allowed.keys().map(String::as_str)
    }

    fn types_for(&self, extension: &str) -> Option<&BTreeSet<&'static str>> {
        self.allowed.get(extension)
    }
}

/// Runs admission checks for uploads and replacements, each with its own policy.
#[derive(Debug, Clone)]
pub struct ContentValidator {
    upload: AdmissionPolicy,
    replace: AdmissionPolicy,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(AdmissionPolicy::upload_default(), AdmissionPolicy::replace_default())
    }
}

impl ContentValidator {
    pub fn new(upload: AdmissionPolicy, replace: AdmissionPolicy) -> Self {
        Self { upload, replace }
    }

    pub async fn admit_upload<R>(&self, filename: &str, reader: &mut R) -> Result<Admitted, ValidationError>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        admit(&self.upload, filename, reader).await
    }

    pub async fn admit_replace<R>(&self, filename: &str, reader: &mut R) -> Result<Admitted, ValidationError>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        admit(&self.replace, filename, reader).await
    }
}

/// Check `filename` and the first [`SNIFF_LEN`] bytes of `reader` against
/// `policy`. The reader is rewound to its start before returning `Ok`.
pub async fn admit<R>(policy: &AdmissionPolicy, filename: &str, reader: &mut R) -> Result<Admitted, ValidationError>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let extension = file_extension(filename);
    let Some(permitted) = policy.types_for(&extension) else {
        return Err(ValidationError::UnsupportedExtension(extension));
    };

    let prefix = read_prefix(reader).await?;
    reader.seek(SeekFrom::Start(0)).await?;

    match sniff_content_type(&prefix) {
        Some(sniffed) if permitted.contains(sniffed) => Ok(Admitted {
            extension,
            sniffed_type: sniffed,
        }),
        other => Err(ValidationError::UnsupportedContentType {
            extension,
            sniffed: other.unwrap_or("application/octet-stream").to_string(),
        }),
    }
}

/// Lowercase extension of `filename` from its last dot, including the dot, or
/// an empty string. A bare name such as `.png` is all extension.
pub fn file_extension(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    name.rfind('.')
        .map(|dot| name[dot..].to_ascii_lowercase())
        .unwrap_or_default()
}

/// MIME type served for a stored object with the given extension.
pub fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    MEDIA_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == extension)
        .map(|(_, mime)| *mime)
}

/// Filename with its final extension removed.
pub fn file_stem(filename: &str) -> String {
    let ext_len = file_extension(filename).len();
    filename[..filename.len() - ext_len].to_string()
}

async fn read_prefix<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

const MP4_BRANDS: [&[u8; 4]; 12] = [
    b"isom", b"iso2", b"iso4", b"iso5", b"iso6", b"mp41", b"mp42", b"avc1", b"M4V ", b"dash",
    b"mmp4", b"msnv",
];
const LEGACY_QT_ATOMS: [&[u8; 4]; 6] = [b"moov", b"mdat", b"wide", b"free", b"skip", b"pnot"];

/// Classify a payload prefix by its magic bytes.
///
/// Returns `None` when the format is not one the service recognises.
pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && data.starts_with(b"RIFF") {
        return match &data[8..12] {
            b"WEBP" => Some("image/webp"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return sniff_ebml(data);
    }
    if data.len() >= 8 {
        return sniff_iso_bmff(data);
    }
    None
}

fn sniff_ebml(data: &[u8]) -> Option<&'static str> {
    if contains(data, b"webm") {
        Some("video/webm")
    } else if contains(data, b"matroska") {
        Some("video/x-matroska")
    } else {
        None
    }
}

fn sniff_iso_bmff(data: &[u8]) -> Option<&'static str> {
    let box_type = &data[4..8];
    if box_type != b"ftyp" {
        return LEGACY_QT_ATOMS
            .iter()
            .any(|atom| box_type == *atom)
            .then_some("video/quicktime");
    }

    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size < 16 || data.len() < 12 {
        return None;
    }
    let major = &data[8..12];
    if major == b"qt  " {
        return Some("video/quicktime");
    }
    // Compatible brands start after the 4-byte minor version.
    let end = box_size.min(data.len());
    let compatible = data.get(16..end).unwrap_or_default();
    let is_mp4 = std::iter::once(major)
        .chain(compatible.chunks_exact(4))
        .any(|brand| MP4_BRANDS.iter().any(|known| brand == *known));
    is_mp4.then_some("video/mp4")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        data.extend_from_slice(&[0, 0, 0, 13]);
        data.extend_from_slice(b"IHDR");
        data.resize(64, 0);
        data
    }

    fn mp4_bytes(major: &[u8; 4]) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 24];
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(major);
        data.extend_from_slice(&[0, 0, 2, 0]);
        data.extend_from_slice(major);
        data.extend_from_slice(b"mp41");
        data.resize(600, 0);
        data
    }

    #[test]
    fn sniffs_known_formats() {
        assert_eq!(sniff_content_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_content_type(&png_bytes()), Some("image/png"));
        assert_eq!(sniff_content_type(b"GIF89a......"), Some("image/gif"));
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0AVI LIST"), Some("video/x-msvideo"));
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_content_type(&mp4_bytes(b"isom")), Some("video/mp4"));
        assert_eq!(sniff_content_type(&mp4_bytes(b"qt  ")), Some("video/quicktime"));
        assert_eq!(sniff_content_type(b"\0\0\0\x08moov\0\0"), Some("video/quicktime"));

        let mut mkv = vec![0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x82, 0x88];
        mkv.extend_from_slice(b"matroska");
        assert_eq!(sniff_content_type(&mkv), Some("video/x-matroska"));
    }

    #[test]
    fn text_is_not_recognised() {
        assert_eq!(sniff_content_type(b"hello, this is plain text"), None);
        assert_eq!(sniff_content_type(b""), None);
    }

    #[test]
    fn extension_helpers() {
        assert_eq!(file_extension("Holiday.JPG"), ".jpg");
        assert_eq!(file_extension("archive.tar.gz"), ".gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_stem("Holiday.JPG"), "Holiday");
        assert_eq!(file_stem("README"), "README");
        assert_eq!(file_extension(".PNG"), ".png");
        assert_eq!(file_stem(".png"), "");
        assert_eq!(file_extension("photos.v2/README"), "");
        assert_eq!(content_type_for_extension(".mkv"), Some("video/x-matroska"));
        assert_eq!(content_type_for_extension(".exe"), None);
    }

    #[test]
    fn policy_rejects_unknown_extension() {
        let err = AdmissionPolicy::from_extensions(["png", ".exe"]).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownPolicyExtension(ext) if ext == ".exe"));

        let policy = AdmissionPolicy::from_extensions(["PNG", " jpg "]).unwrap();
        assert_eq!(policy.extensions().collect::<Vec<_>>(), vec![".jpg", ".png"]);
    }

    #[tokio::test]
    async fn admits_png_and_rewinds() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(png_bytes());
        let admitted = validator.admit_upload("cat.PNG", &mut reader).await.unwrap();
        assert_eq!(admitted.extension, ".png");
        assert_eq!(admitted.sniffed_type, "image/png");
        assert_eq!(reader.position(), 0);
    }

    #[tokio::test]
    async fn admits_name_that_is_only_an_extension() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(png_bytes());
        let admitted = validator.admit_upload(".png", &mut reader).await.unwrap();
        assert_eq!(admitted.extension, ".png");
    }

    #[tokio::test]
    async fn rejects_disallowed_extension_before_reading() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(png_bytes());
        let err = validator.admit_upload("cat.gif", &mut reader).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedExtension(ext) if ext == ".gif"));
        assert_eq!(reader.position(), 0);

        let err = validator.admit_upload("noextension", &mut reader).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedExtension(_)));
    }

    #[tokio::test]
    async fn rejects_text_renamed_to_jpg() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(b"just some text pretending".to_vec());
        let err = validator.admit_upload("photo.jpg", &mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnsupportedContentType { ref sniffed, .. } if sniffed == "application/octet-stream"
        ));
    }

    #[tokio::test]
    async fn rejects_extension_content_mismatch() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(png_bytes());
        let err = validator.admit_upload("photo.jpg", &mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnsupportedContentType { ref sniffed, .. } if sniffed == "image/png"
        ));
    }

    #[tokio::test]
    async fn replace_policy_is_stricter() {
        let validator = ContentValidator::default();
        let mut reader = Cursor::new(mp4_bytes(b"qt  "));
        assert!(validator.admit_upload("clip.mov", &mut reader).await.is_ok());
        let err = validator.admit_replace("clip.mov", &mut reader).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedExtension(_)));
    }
}
