/*!
Amazon S3 object store implementation.

Stores the snapshot as a single object using the official AWS SDK.
*/

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info};

use super::ObjectStore;
use crate::{Result, ThawError};

/// Amazon S3 object store
///
/// # Authentication
/// The adapter uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles and Lambda execution roles
///
/// # Example
/// ```rust,no_run
/// use thaw_core::storage::{ObjectStore, S3ObjectStore};
///
/// # async fn run() -> thaw_core::Result<()> {
/// let store = S3ObjectStore::connect("my-cache-bucket".to_string(), None, None).await?;
/// store.put("warm/my-function.zst", b"compressed snapshot".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store for the specified bucket
    ///
    /// # Arguments
    /// * `bucket` - The S3 bucket name
    /// * `region` - Region override; the environment decides when `None`
    /// * `endpoint` - Custom endpoint for S3-compatible services (path-style addressing)
    ///
    /// # Errors
    /// Returns an error if no credentials provider could be configured.
    pub async fn connect(
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(ThawError::storage(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION environment variables",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(bucket = %bucket, endpoint = ?endpoint, "Initialized S3 object store");

        Ok(Self::with_client(client, bucket))
    }

    /// Create a store from an already configured client
    pub fn with_client(client: S3Client, bucket: String) -> Self {
        S3ObjectStore { client, bucket }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        debug!(bucket = %self.bucket, key = %key, "Starting S3 get_object operation");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("get_object", e, key))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ThawError::storage(format!("Failed to read S3 object stream: {e}")))?
            .into_bytes()
            .to_vec();

        debug!(bucket = %self.bucket, key = %key, size = data.len(), "Loaded snapshot from S3");
        Ok(data)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len();
        debug!(bucket = %self.bucket, key = %key, size, "Starting S3 put_object operation");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, key))?;

        debug!(bucket = %self.bucket, key = %key, size, "Saved snapshot to S3");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Map AWS SDK errors to ThawError with appropriate context
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: SdkError<E>,
    key: &str,
) -> ThawError {
    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            ThawError::storage(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            ThawError::storage(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            ThawError::storage(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("NoSuchKey") | Some("NotFound") => ThawError::not_found(key),
            Some("NoSuchBucket") => ThawError::storage("S3 bucket not found"),
            Some("AccessDenied") | Some("Forbidden") => ThawError::storage(
                "Access denied to S3 (check credentials and permissions)",
            ),
            Some(code) => ThawError::storage(format!(
                "S3 service error ({code}): {}",
                service_err.err().message().unwrap_or("Unknown error")
            )),
            None => ThawError::storage(format!("S3 {op} service error: {service_err:?}")),
        },
        _ => ThawError::storage(format!("S3 {op} error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;
    use aws_sdk_s3::operation::put_object::PutObjectError;

    #[test]
    fn test_timeout_error_mapping() {
        let timeout: SdkError<GetObjectError> = SdkError::timeout_error("too slow");
        let mapped = map_s3_error("get_object", timeout, "warm/fn.zst");

        match mapped {
            ThawError::Storage(msg) => {
                assert!(msg.contains("timed out"));
                assert!(msg.contains("warm/fn.zst"));
            }
            other => panic!("Expected storage error for timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_construction_failure_mapping() {
        let failure: SdkError<PutObjectError> = SdkError::construction_failure("bad request");
        let mapped = map_s3_error("put_object", failure, "warm/fn.zst");

        assert!(matches!(mapped, ThawError::Storage(ref msg) if msg.contains("put_object")));
        assert!(!mapped.is_not_found());
    }
}
