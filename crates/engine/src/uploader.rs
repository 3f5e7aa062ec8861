use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use brenda_core::error::TaskError;
use brenda_core::retry::{RetryPolicy, retry};
use tracing::{error, info};

use crate::api::ObjectStore;
use crate::process::{UPLOAD_RUNNING, UploadTask};

/// Start the in-process uploader for a finished task's outdir.
///
/// The whole push is wrapped in the retry harness; only when the budget is
/// exhausted does the task publish a failing exit code, which the wait phase
/// treats as fatal.
pub(crate) fn start_upload<S: ObjectStore>(
    store: Arc<S>,
    outdir: PathBuf,
    policy: RetryPolicy,
) -> UploadTask {
    let code = Arc::new(AtomicI32::new(UPLOAD_RUNNING));
    let published = code.clone();
    let handle = tokio::spawn(async move {
        let result = retry(&policy, {
            let store = store.clone();
            let outdir = outdir.clone();
            move || {
                let store = store.clone();
                let outdir = outdir.clone();
                async move { push_outputs(store.as_ref(), &outdir).await }
            }
        })
        .await;
        let exit = match result {
            Ok(count) => {
                info!("uploaded {count} files from {}", outdir.display());
                0
            }
            Err(err) => {
                error!("upload from {} failed: {err:#}", outdir.display());
                1
            }
        };
        published.store(exit, Ordering::SeqCst);
    });
    UploadTask { handle, code }
}

/// Upload every regular file at the top level of `outdir` under its own
/// name. Uploads overwrite, so re-running after a crash converges on the
/// same objects.
async fn push_outputs<S: ObjectStore>(store: &S, outdir: &Path) -> Result<usize, TaskError> {
    let mut entries = tokio::fs::read_dir(outdir)
        .await
        .map_err(|err| TaskError::transient(anyhow::anyhow!("reading {}: {err}", outdir.display())))?;
    let mut count = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| TaskError::transient(anyhow::anyhow!("reading {}: {err}", outdir.display())))?
    {
        let file_type = entry.file_type().await.map_err(|err| {
            TaskError::transient(anyhow::anyhow!("stat {}: {err}", entry.path().display()))
        })?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        info!("uploading {} to {}", path.display(), store.object_url(&name));
        store.upload(&path, &name).await?;
        count += 1;
    }
    Ok(count)
}
