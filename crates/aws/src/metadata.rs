use std::time::Duration;

use brenda_core::error::TaskError;

use crate::transient_err;

const INSTANCE_ID_URL: &str = "http://169.254.169.254/latest/meta-data/instance-id";

/// Ask the cloud-local metadata service who we are. Only meaningful on an
/// EC2 instance (`RUNNING_ON_EC2=1`); elsewhere the connection times out.
pub async fn self_instance_id() -> Result<String, TaskError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(transient_err("building metadata client"))?;
    let response = client
        .get(INSTANCE_ID_URL)
        .send()
        .await
        .map_err(transient_err("querying instance metadata"))?
        .error_for_status()
        .map_err(transient_err("querying instance metadata"))?;
    let id = response
        .text()
        .await
        .map_err(transient_err("reading instance metadata"))?;
    Ok(id.trim().to_string())
}
