use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    storage::{extension_for, BlobBucket, BlobStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
    Audio,
    File,
}

impl UploadKind {
    /// Whether a content type is acceptable for this kind. Plain files take anything.
    pub fn accepts(&self, content_type: &str) -> bool {
        match self {
            Self::Image => content_type.starts_with("image/"),
            Self::Video => content_type.starts_with("video/"),
            Self::Audio => content_type.starts_with("audio/"),
            Self::File => true,
        }
    }

    fn dir(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
            Self::Audio => "audio",
            Self::File => "files",
        }
    }
}

impl FromStr for UploadKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            other => Err(AppError::BadRequest(format!("Unknown upload kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedMedia {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
}

/// Stores message attachments. The returned URL goes into a message's media reference.
#[derive(Clone)]
pub struct MediaUploads {
    blobs: Arc<dyn BlobStore>,
}

impl MediaUploads {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn upload(
        &self,
        user_id: Uuid,
        kind: UploadKind,
        file_name: Option<String>,
        content_type: &str,
        data: Bytes,
    ) -> AppResult<UploadedMedia> {
        if data.is_empty() {
            return Err(AppError::BadRequest("File required".to_string()));
        }
        if !kind.accepts(content_type) {
            return Err(AppError::Validation(format!(
                "Content type {} does not match upload kind",
                content_type
            )));
        }

        let extension = match extension_for(content_type) {
            "bin" => file_name
                .as_deref()
                .and_then(|name| name.rsplit_once('.'))
                .map(|(_, ext)| ext)
                .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .unwrap_or("bin")
                .to_string(),
            known => known.to_string(),
        };
        let key = format!("{}/{}/{}.{}", kind.dir(), user_id, Uuid::new_v4(), extension);
        let file_size = data.len() as u64;

        let url = self
            .blobs
            .upload(BlobBucket::Attachments, &key, data, content_type)
            .await?;
        tracing::debug!(%user_id, %key, file_size, "Attachment uploaded");

        Ok(UploadedMedia {
            url,
            file_name: file_name.unwrap_or_else(|| format!("upload.{}", extension)),
            file_size,
            content_type: content_type.to_string(),
        })
    }
}
