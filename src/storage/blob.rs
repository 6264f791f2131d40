use async_trait::async_trait;
use bytes::Bytes;

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBucket {
    Avatars,
    Attachments,
}

impl BlobBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avatars => "avatars",
            Self::Attachments => "attachments",
        }
    }
}

/// Opaque media storage returning a retrievable URL for each upload.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        bucket: BlobBucket,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> AppResult<String>;

    async fn delete(&self, bucket: BlobBucket, key: &str) -> AppResult<()>;
}

/// File extension for an upload, derived from its content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/webm" => "weba",
        "audio/wav" | "audio/x-wav" => "wav",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
