use std::path::Path;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use brenda_core::config::Config;
use brenda_core::error::TaskError;
use brenda_core::urls::S3Url;
use brenda_engine::ObjectStore;

use crate::{sdk_config, transient_err};

/// The S3 bucket/prefix render output lands in, from the `OUTPUT_URL`
/// config key (`RENDER_OUTPUT` is accepted as the older spelling).
pub struct S3OutputStore {
    client: Client,
    url: S3Url,
}

impl S3OutputStore {
    pub async fn connect(conf: &Config) -> Result<Self, TaskError> {
        let raw = conf
            .get("OUTPUT_URL")
            .or_else(|| conf.get("RENDER_OUTPUT"))
            .ok_or_else(|| TaskError::fatal_msg("config key \"OUTPUT_URL\" is missing"))?;
        let url = S3Url::parse(raw)?;
        let client = Client::new(&sdk_config("S3_REGION", conf).await);
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &S3Url {
        &self.url
    }
}

impl ObjectStore for S3OutputStore {
    /// Put `local_path` at `{prefix}{name}`. Same name, same key: re-running
    /// a task overwrites its previous output.
    async fn upload(&self, local_path: &Path, name: &str) -> Result<(), TaskError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(transient_err("reading upload body"))?;
        self.client
            .put_object()
            .bucket(&self.url.bucket)
            .key(format!("{}{}", self.url.prefix, name))
            .body(body)
            .send()
            .await
            .map_err(transient_err("uploading object"))?;
        Ok(())
    }

    fn object_url(&self, name: &str) -> String {
        self.url.object_url(name)
    }
}
