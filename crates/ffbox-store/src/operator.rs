//! OpenDAL Operator factory for ffbox storage backends.

use anyhow::{Context, Result};
use opendal::Operator;

use crate::source::Source;

/// Bounded retry for transient failures. 404/NotFound is never retried.
const RETRY_ATTEMPTS: usize = 3;

/// Build an operator for a mount source.
///
/// S3: bucket from the source URL, region from `AWS_REGION` (default
/// us-east-1), optional custom endpoint from `AWS_ENDPOINT_URL`. When
/// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` are absent the client runs
/// unsigned, which permits read-only access to public buckets.
///
/// Local: the filesystem service rooted at the deployed directory.
pub fn build_operator(source: &Source) -> Result<Operator> {
    let op = match source {
        Source::S3 { bucket, .. } => {
            let region =
                std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
            let mut builder = opendal::services::S3::default()
                .bucket(bucket)
                .region(&region);
            if let Ok(endpoint) = std::env::var("AWS_ENDPOINT_URL") {
                builder = builder.endpoint(&endpoint);
            }
            let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok();
            let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
            builder = match (access_key, secret_key) {
                (Some(ak), Some(sk)) => builder.access_key_id(&ak).secret_access_key(&sk),
                _ => {
                    tracing::info!(bucket = %bucket, "no S3 credentials in environment, using anonymous access");
                    builder
                        .allow_anonymous()
                        .disable_config_load()
                        .disable_ec2_metadata()
                }
            };
            Operator::new(builder)
                .context("creating S3 operator")?
                .finish()
        }
        Source::Local { root } => {
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .context("creating local fs operator")?
                .finish()
        }
    };

    Ok(op
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(RETRY_ATTEMPTS)
                .with_jitter(),
        ))
}
