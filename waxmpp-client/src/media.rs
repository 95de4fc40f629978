//! Media collaborators.
//!
//! Transfer and thumbnailing are outside the session core: uploads and
//! downloads run over plain HTTPS against the host the server allocates,
//! and thumbnail generation needs an image toolchain. Both sit behind
//! traits so hosts can plug in whatever they run.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::ClientError;

/// Result of a successful upload.
#[derive(Clone, Debug)]
pub struct UploadedMedia {
    pub url: String,
    pub media_type: String,
    pub size: u64,
    pub name: String,
}

/// HTTPS media transfer.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// POST `local_path` to `dest_url` and return the hosted descriptor.
    async fn upload(
        &self,
        local_path: &Path,
        dest_url: &str,
        media_type: &str,
        from: &str,
        to: &str,
    ) -> Result<UploadedMedia, ClientError>;

    /// Fetch `url` to a local file and return its path.
    async fn download(&self, url: &str) -> Result<PathBuf, ClientError>;
}

/// A store that refuses every transfer. Default until the host wires a
/// real one; media sends then fail with a `MediaError` event instead of
/// hanging.
pub struct NullMediaStore;

#[async_trait]
impl MediaStore for NullMediaStore {
    async fn upload(
        &self,
        _local_path: &Path,
        _dest_url: &str,
        _media_type: &str,
        _from: &str,
        _to: &str,
    ) -> Result<UploadedMedia, ClientError> {
        Err(ClientError::Media("no media store configured".into()))
    }

    async fn download(&self, _url: &str) -> Result<PathBuf, ClientError> {
        Err(ClientError::Media("no media store configured".into()))
    }
}

// ─── Thumbnailer ─────────────────────────────────────────────────────────────

/// JPEG preview generation for outbound image/video messages.
pub trait Thumbnailer: Send + Sync {
    fn image_thumbnail(&self, path: &Path) -> Result<Vec<u8>, ClientError>;
    fn video_thumbnail(&self, path: &Path) -> Result<Vec<u8>, ClientError>;
}

/// 1×1 grey JPEG used when no real thumbnailer is configured.
const DEFAULT_THUMBNAIL: &[u8] = &[
    0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xff, 0xdb, 0x00, 0x43, 0x00, 0x10, 0x0b, 0x0c, 0x0e, 0x0c,
    0x0a, 0x10, 0x0e, 0x0d, 0x0e, 0x12, 0x11, 0x10, 0x13, 0x18, 0x28, 0x1a, 0x18, 0x16, 0x16,
    0x18, 0x31, 0x23, 0x25, 0x1d, 0x28, 0x3a, 0x33, 0x3d, 0x3c, 0x39, 0x33, 0x38, 0x37, 0x40,
    0x48, 0x5c, 0x4e, 0x40, 0x44, 0x57, 0x45, 0x37, 0x38, 0x50, 0x6d, 0x51, 0x57, 0x5f, 0x62,
    0x67, 0x68, 0x67, 0x3e, 0x4d, 0x71, 0x79, 0x70, 0x64, 0x78, 0x5c, 0x65, 0x67, 0x63, 0xff,
    0xc0, 0x00, 0x0b, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0xff, 0xc4, 0x00,
    0x1f, 0x00, 0x00, 0x01, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
    0xff, 0xc4, 0x00, 0x14, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xda, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3f, 0x00,
    0x7f, 0x0f, 0xff, 0xd9,
];

/// Fallback thumbnailer: always returns the built-in placeholder JPEG.
pub struct FixedThumbnailer;

impl Thumbnailer for FixedThumbnailer {
    fn image_thumbnail(&self, _path: &Path) -> Result<Vec<u8>, ClientError> {
        Ok(DEFAULT_THUMBNAIL.to_vec())
    }

    fn video_thumbnail(&self, _path: &Path) -> Result<Vec<u8>, ClientError> {
        Ok(DEFAULT_THUMBNAIL.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_thumbnailer_yields_jpeg_magic() {
        let bytes = FixedThumbnailer
            .image_thumbnail(Path::new("/nonexistent"))
            .unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xff, 0xd9]);
    }

    #[tokio::test]
    async fn null_store_refuses_uploads() {
        let err = NullMediaStore
            .upload(Path::new("/tmp/x.jpg"), "https://mms.example", "image", "a", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Media(_)));
    }
}
