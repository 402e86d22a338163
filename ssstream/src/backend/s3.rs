use super::{CompletionToken, MultipartBackend};
use crate::error::BackendError;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_types::region::Region;
use bytes::Bytes;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Implementation of [`MultipartBackend`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub struct S3Backend {
    inner: Arc<S3BackendInner>,
}

struct S3BackendInner {
    client: aws_sdk_s3::Client,
}

impl S3Backend {
    /// Construct a backend using the AWS configuration from the environment, overridden by the
    /// endpoint and region in `config` if they're set.
    pub async fn new(config: &Config) -> Self {
        Self::from_client(make_s3_client(config, config.aws_region.clone()).await)
    }

    /// Use an already-configured S3 client
    pub fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self {
            inner: Arc::new(S3BackendInner { client }),
        }
    }
}

/// Split an S3 URL of the form `s3://bucket/key` into the bucket and object key.
///
/// The key may be empty if the URL only names a bucket.
pub fn parse_s3_url(url: &Url) -> Result<(String, String)> {
    ensure!(
        url.scheme() == "s3",
        crate::error::UnsupportedUrlSnafu { url: url.clone() }
    );

    // S3 URLs are of the form:
    // s3://bucket/path
    // In URL terms, the `bucket` part is considered the host name.
    let bucket = url
        .host_str()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

    // The path component of the URL always starts with `/`, which isn't part of the key
    let key = url.path().strip_prefix('/').unwrap_or_else(|| url.path());

    Ok((bucket.to_string(), key.to_string()))
}

fn boxed(e: impl std::error::Error + Send + Sync + 'static) -> BackendError {
    Box::new(e)
}

#[async_trait::async_trait]
impl MultipartBackend for S3Backend {
    #[instrument(skip(self))]
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(boxed)
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        Ok(upload_id)
    }

    #[instrument(skip(self, body, content_md5), fields(size = body.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        content_md5: Option<String>,
    ) -> Result<String> {
        let response = self
            .inner
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .set_content_md5(content_md5)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(boxed)
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
                part_number,
            })?;

        let e_tag = response
            .e_tag()
            .with_context(|| crate::error::MissingETagSnafu {
                operation: "UploadPart",
                key: key.to_string(),
            })?
            .to_string();

        debug!(%e_tag, "Uploaded multi-part chunk");

        Ok(e_tag)
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletionToken>,
    ) -> Result<Option<String>> {
        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(part.e_tag)
                    .part_number(part.part_number as i32)
                    .build()
            })
            .collect::<Vec<_>>();

        let response = self
            .inner
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(boxed)
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(response.e_tag().map(|e_tag| e_tag.to_string()))
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.inner
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(boxed)
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into();

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };
    let aws_config = aws_config::from_env().region(region_provider).load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't support virtual-hosted style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
