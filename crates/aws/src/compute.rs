use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    Filter, IamInstanceProfileSpecification, InstanceType, SpotInstanceType, Tag,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use brenda_core::config::Config;
use brenda_core::error::TaskError;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{sdk_config, transient_err};

/// Parameters shared by on-demand and spot launches.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub ami_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub instance_profile: Option<String>,
    /// Plain-text startup script; base64-encoded on the wire by the driver.
    pub user_data: Option<String>,
    pub count: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotKind {
    /// Fulfilled once; the request dies with the instance.
    OneTime,
    /// Re-fulfilled automatically until cancelled.
    Persistent,
}

/// The slice of instance state the fleet tools work with.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub image_id: String,
    pub instance_type: String,
    pub state: String,
    pub launch_time: i64,
    pub public_dns_name: String,
    pub spot_request_id: Option<String>,
    pub volume_ids: Vec<String>,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SpotRequestInfo {
    pub id: String,
    pub state: String,
    pub status: Option<String>,
    pub kind: Option<String>,
    pub price: Option<String>,
    pub create_time: Option<i64>,
    pub instance_id: Option<String>,
    pub tags: Vec<(String, String)>,
}

/// Host-side selection applied to instance listings.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilters {
    /// `tag:<key> = <value>` pairs.
    pub tags: Vec<(String, String)>,
    pub instance_type: Option<String>,
    /// Public DNS names to match.
    pub hosts: Vec<String>,
    /// Raw provider filters, e.g. `instance-state-name = running`.
    pub extra: Vec<(String, Vec<String>)>,
    /// Admit only instances in the last `threshold` minutes of their
    /// wall-clock hour, so pruning lands near the billing boundary.
    pub uptime_threshold_minutes: Option<u32>,
}

/// EC2 driver for launching, listing and reaping worker instances.
pub struct Ec2Compute {
    client: Client,
}

impl Ec2Compute {
    pub async fn connect(conf: &Config) -> Self {
        Self {
            client: Client::new(&sdk_config("EC2_REGION", conf).await),
        }
    }

    /// Launch `spec.count` on-demand instances, returning their ids (empty
    /// on a dry run).
    pub async fn run_on_demand(&self, spec: &LaunchSpec) -> Result<Vec<String>, TaskError> {
        let mut req = self
            .client
            .run_instances()
            .image_id(&spec.ami_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(spec.count as i32)
            .key_name(&spec.key_name)
            .dry_run(spec.dry_run);
        for group in &spec.security_groups {
            req = req.security_groups(group);
        }
        if let Some(profile) = &spec.instance_profile {
            req = req.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        if let Some(user_data) = &spec.user_data {
            req = req.user_data(B64.encode(user_data));
        }

        let Some(out) = dry_run_ok("requesting instances", req.send().await)? else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = out
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();
        info!("launched instances: {ids:?}");
        Ok(ids)
    }

    /// Issue spot requests at `price`, returning the request ids (empty on
    /// a dry run).
    pub async fn run_spot(
        &self,
        spec: &LaunchSpec,
        kind: SpotKind,
        price: &str,
    ) -> Result<Vec<String>, TaskError> {
        let mut launch = aws_sdk_ec2::types::RequestSpotLaunchSpecification::builder()
            .image_id(&spec.ami_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .key_name(&spec.key_name)
            .set_security_groups(Some(spec.security_groups.clone()));
        if let Some(profile) = &spec.instance_profile {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        if let Some(user_data) = &spec.user_data {
            launch = launch.user_data(B64.encode(user_data));
        }

        let req = self
            .client
            .request_spot_instances()
            .spot_price(price)
            .r#type(match kind {
                SpotKind::OneTime => SpotInstanceType::OneTime,
                SpotKind::Persistent => SpotInstanceType::Persistent,
            })
            .instance_count(spec.count as i32)
            .launch_specification(launch.build())
            .dry_run(spec.dry_run);

        let Some(out) = dry_run_ok("requesting spot instances", req.send().await)? else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> = out
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect();
        info!("issued spot requests: {ids:?}");
        Ok(ids)
    }

    pub async fn terminate(&self, ids: &[String], dry_run: bool) -> Result<(), TaskError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!("terminate instances: {ids:?}");
        let req = self
            .client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .dry_run(dry_run);
        dry_run_ok("terminating instances", req.send().await)?;
        Ok(())
    }

    pub async fn stop(&self, ids: &[String], dry_run: bool) -> Result<(), TaskError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!("stop instances: {ids:?}");
        let req = self
            .client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .dry_run(dry_run);
        dry_run_ok("stopping instances", req.send().await)?;
        Ok(())
    }

    /// Stop or terminate instances, first cancelling their spot requests so
    /// persistent requests do not re-launch replacements.
    pub async fn shutdown_instances(
        &self,
        ids: &[String],
        terminate: bool,
        dry_run: bool,
    ) -> Result<(), TaskError> {
        if ids.is_empty() {
            debug!("shutdown: no instances specified");
            return Ok(());
        }
        self.cancel_spot_requests_of(ids, dry_run).await?;
        if terminate {
            self.terminate(ids, dry_run).await
        } else {
            self.stop(ids, dry_run).await
        }
    }

    pub async fn list_instances(
        &self,
        filters: &[(String, Vec<String>)],
    ) -> Result<Vec<InstanceInfo>, TaskError> {
        let out = self
            .client
            .describe_instances()
            .set_filters(to_sdk_filters(filters))
            .send()
            .await
            .map_err(transient_err("listing instances"))?;
        let instances = out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(instance_info)
            .collect();
        Ok(instances)
    }

    pub async fn describe_instance(&self, id: &str) -> Result<Option<InstanceInfo>, TaskError> {
        let out = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(transient_err("describing instance"))?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(instance_info)
            .next())
    }

    /// Apply the fleet-level selection and return the listing in the fixed
    /// `(image_id, launch_time, public_dns_name)` order the CLIs print.
    pub async fn filter_instances(
        &self,
        filters: &InstanceFilters,
    ) -> Result<Vec<InstanceInfo>, TaskError> {
        let mut raw = Vec::new();
        for (key, value) in &filters.tags {
            raw.push((format!("tag:{key}"), vec![value.clone()]));
        }
        if let Some(instance_type) = &filters.instance_type {
            raw.push(("instance-type".to_string(), vec![instance_type.clone()]));
        }
        if !filters.hosts.is_empty() {
            raw.push(("dns-name".to_string(), filters.hosts.clone()));
        }
        raw.extend(filters.extra.iter().cloned());
        debug!("instance filters: {raw:?}");

        let mut instances = self.list_instances(&raw).await?;
        if let Some(threshold) = filters.uptime_threshold_minutes {
            let now = Utc::now().timestamp();
            instances.retain(|i| near_hour_boundary(now - i.launch_time, threshold));
        }
        instances.sort_by(|a, b| {
            (&a.image_id, a.launch_time, &a.public_dns_name)
                .cmp(&(&b.image_id, b.launch_time, &b.public_dns_name))
        });
        Ok(instances)
    }

    pub async fn list_spot_requests(
        &self,
        filters: &[(String, Vec<String>)],
    ) -> Result<Vec<SpotRequestInfo>, TaskError> {
        debug!("spot request filters: {filters:?}");
        let out = self
            .client
            .describe_spot_instance_requests()
            .set_filters(to_sdk_filters(filters))
            .send()
            .await
            .map_err(transient_err("listing spot requests"))?;
        let requests = out
            .spot_instance_requests()
            .iter()
            .map(|r| SpotRequestInfo {
                id: r.spot_instance_request_id().unwrap_or_default().to_string(),
                state: r
                    .state()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                status: r.status().and_then(|s| s.code()).map(str::to_string),
                kind: r.r#type().map(|t| t.as_str().to_string()),
                price: r.spot_price().map(str::to_string),
                create_time: r.create_time().map(aws_sdk_ec2::primitives::DateTime::secs),
                instance_id: r.instance_id().map(str::to_string),
                tags: tag_pairs(r.tags()),
            })
            .collect();
        Ok(requests)
    }

    pub async fn cancel_spot_requests(
        &self,
        ids: &[String],
        dry_run: bool,
    ) -> Result<(), TaskError> {
        if ids.is_empty() {
            return Ok(());
        }
        info!("cancel spot requests: {ids:?}");
        let req = self
            .client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .dry_run(dry_run);
        dry_run_ok("cancelling spot requests", req.send().await)?;
        Ok(())
    }

    /// Cancel whatever spot requests back the given instances.
    pub async fn cancel_spot_requests_of(
        &self,
        instance_ids: &[String],
        dry_run: bool,
    ) -> Result<(), TaskError> {
        let out = self
            .client
            .describe_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(transient_err("describing instances"))?;
        let sirs: Vec<String> = out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|i| i.spot_instance_request_id().map(str::to_string))
            .collect();
        self.cancel_spot_requests(&sirs, dry_run).await
    }

    /// The spot request backing `instance_id`, when there is one.
    pub async fn get_spot_request_of(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, TaskError> {
        Ok(self
            .describe_instance(instance_id)
            .await?
            .and_then(|i| i.spot_request_id))
    }

    pub async fn create_tags(
        &self,
        resource_ids: &[String],
        tags: &[(String, String)],
    ) -> Result<(), TaskError> {
        if resource_ids.is_empty() || tags.is_empty() {
            return Ok(());
        }
        info!("tagging {resource_ids:?} with {tags:?}");
        let tags: Vec<Tag> = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();
        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(transient_err("tagging resources"))?;
        Ok(())
    }
}

fn instance_info(instance: &aws_sdk_ec2::types::Instance) -> InstanceInfo {
    InstanceInfo {
        id: instance.instance_id().unwrap_or_default().to_string(),
        image_id: instance.image_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_default(),
        launch_time: instance
            .launch_time()
            .map(aws_sdk_ec2::primitives::DateTime::secs)
            .unwrap_or_default(),
        public_dns_name: instance.public_dns_name().unwrap_or_default().to_string(),
        spot_request_id: instance.spot_instance_request_id().map(str::to_string),
        volume_ids: instance
            .block_device_mappings()
            .iter()
            .filter_map(|m| m.ebs().and_then(|e| e.volume_id()).map(str::to_string))
            .collect(),
        tags: tag_pairs(instance.tags()),
    }
}

fn tag_pairs(tags: &[Tag]) -> Vec<(String, String)> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

fn to_sdk_filters(filters: &[(String, Vec<String>)]) -> Option<Vec<Filter>> {
    if filters.is_empty() {
        return None;
    }
    Some(
        filters
            .iter()
            .map(|(name, values)| {
                Filter::builder()
                    .name(name)
                    .set_values(Some(values.clone()))
                    .build()
            })
            .collect(),
    )
}

/// Dry-run launches come back as a distinct service error; surface them as
/// success-with-warning rather than a failure.
fn dry_run_ok<T, E>(what: &'static str, result: Result<T, SdkError<E>>) -> Result<Option<T>, TaskError>
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match result {
        Ok(out) => Ok(Some(out)),
        Err(err) if err.code() == Some("DryRunOperation") => {
            warn!("{what}: {}", err.message().unwrap_or("dry run successful"));
            Ok(None)
        }
        Err(err) => Err(TaskError::transient(anyhow::Error::new(err).context(what))),
    }
}

/// True only in the last `threshold` minutes of each wall-clock hour of
/// uptime. Used to prune instances just before they cross into the next
/// billing hour; deliberately not a minimum-age check.
pub fn near_hour_boundary(uptime_secs: i64, threshold_minutes: u32) -> bool {
    (uptime_secs / 60) % 60 >= i64::from(threshold_minutes)
}

/// `D days, H:MM:SS`-style uptime for the status listing.
pub fn format_uptime(secs: i64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d {hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours}:{minutes:02}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_boundary_selector_wraps_each_hour() {
        // 55 minutes up, threshold 50: inside the pruning window.
        assert!(near_hour_boundary(55 * 60, 50));
        // 10 minutes up: too early.
        assert!(!near_hour_boundary(10 * 60, 50));
        // 70 minutes up: 10 minutes into the second hour, too early again.
        assert!(!near_hour_boundary(70 * 60, 50));
        // 115 minutes up: 55 minutes into the second hour.
        assert!(near_hour_boundary(115 * 60, 50));
        // Threshold 0 admits everything.
        assert!(near_hour_boundary(0, 0));
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(59), "0:00:59");
        assert_eq!(format_uptime(3661), "1:01:01");
        assert_eq!(format_uptime(90_061), "1d 1:01:01");
    }

    #[test]
    fn filters_skip_empty() {
        assert!(to_sdk_filters(&[]).is_none());
        let filters = to_sdk_filters(&[(
            "instance-state-name".to_string(),
            vec!["running".to_string()],
        )])
        .unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].name(), Some("instance-state-name"));
        assert_eq!(filters[0].values(), ["running"]);
    }
}
