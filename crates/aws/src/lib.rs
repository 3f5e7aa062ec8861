#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Thin drivers over the provider APIs: the SQS work queue, the S3 output
//! store, EC2 instances/spot requests and the instance metadata service.

pub mod compute;
pub mod metadata;
pub mod queue;
pub mod store;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use brenda_core::config::Config;
use brenda_core::error::TaskError;

/// Load shared SDK config, honouring a per-service region override key
/// (`SQS_REGION`, `S3_REGION`, `EC2_REGION`). Credentials come from the
/// default provider chain: environment, shared profile or instance role.
pub(crate) async fn sdk_config(region_key: &str, conf: &Config) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = conf.get(region_key) {
        loader = loader.region(Region::new(region.to_string()));
    }
    loader.load().await
}

/// Driver call failures are worth retrying: network errors, throttling and
/// service hiccups all surface here.
pub(crate) fn transient_err<E>(what: &'static str) -> impl FnOnce(E) -> TaskError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |err| TaskError::transient(anyhow::Error::new(err).context(what))
}
