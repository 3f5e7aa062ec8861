use crate::error::TaskError;

/// Location of the render output bucket, parsed from `s3://BUCKET[/PREFIX]`.
///
/// A non-empty prefix always carries a trailing `/` so object names can be
/// appended directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Url {
    pub bucket: String,
    pub prefix: String,
}

impl S3Url {
    pub fn parse(url: &str) -> Result<Self, TaskError> {
        let rest = url
            .strip_prefix("s3://")
            .ok_or_else(|| TaskError::fatal_msg(format!("{url:?} must be an s3:// URL")))?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(TaskError::fatal_msg(format!("{url:?} has an empty bucket name")));
        }
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix,
        })
    }

    /// The full `s3://` URL of an object named `name` under this location.
    pub fn object_url(&self, name: &str) -> String {
        format!("s3://{}/{}{}", self.bucket, self.prefix, name)
    }
}

/// Parse a work queue name from `sqs://NAME`.
pub fn parse_sqs_url(url: &str) -> Result<&str, TaskError> {
    let name = url
        .strip_prefix("sqs://")
        .ok_or_else(|| TaskError::fatal_msg(format!("{url:?} must be an sqs:// URL")))?;
    if name.is_empty() {
        return Err(TaskError::fatal_msg(format!("{url:?} has an empty queue name")));
    }
    Ok(name)
}
