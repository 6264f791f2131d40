use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials},
    primitives::ByteStream,
    types::{BucketCannedAcl, ObjectCannedAcl},
    Client, Config,
};
use bytes::Bytes;

use super::{BlobBucket, BlobStore};
use crate::{
    config::MinioConfig,
    error::{AppError, AppResult},
};

#[derive(Clone)]
pub struct MinioClient {
    client: Client,
    config: MinioConfig,
}

impl MinioClient {
    pub fn new(config: &MinioConfig) -> Self {
        let creds = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "minio",
        );

        let s3_config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            config: config.clone(),
        }
    }

    pub async fn ensure_buckets(&self) -> AppResult<()> {
        for bucket in [BlobBucket::Avatars, BlobBucket::Attachments] {
            self.create_bucket_if_not_exists(self.bucket_name(bucket))
                .await?;
        }
        Ok(())
    }

    async fn create_bucket_if_not_exists(&self, bucket: &str) -> AppResult<()> {
        let result = self.client.head_bucket().bucket(bucket).send().await;

        if result.is_err() {
            self.client
                .create_bucket()
                .bucket(bucket)
                .acl(BucketCannedAcl::PublicRead)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create bucket: {}", e))?;
            tracing::info!("Created bucket: {}", bucket);
        }

        Ok(())
    }

    fn bucket_name(&self, bucket: BlobBucket) -> &str {
        match bucket {
            BlobBucket::Avatars => &self.config.avatars_bucket,
            BlobBucket::Attachments => &self.config.attachments_bucket,
        }
    }

    /// Objects are public-read, so the URL is served directly by MinIO or the CDN in front of it.
    fn object_url(&self, bucket: &str, key: &str) -> String {
        let base = self.config.public_url.as_deref().unwrap_or(&self.config.endpoint);
        format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key)
    }
}

#[async_trait]
impl BlobStore for MinioClient {
    async fn upload(
        &self,
        bucket: BlobBucket,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> AppResult<String> {
        let bucket = self.bucket_name(bucket);
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| AppError::TransientStore(format!("Failed to upload file: {}", e)))?;

        Ok(self.object_url(bucket, key))
    }

    async fn delete(&self, bucket: BlobBucket, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(self.bucket_name(bucket))
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::TransientStore(format!("Failed to delete file: {}", e)))?;

        Ok(())
    }
}
