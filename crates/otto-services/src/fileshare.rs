//! Upload/download against a shared file storage.
//!
//! The share is addressed by relative paths; this implementation mirrors it
//! onto a local directory, which is enough for scheduler-side staging and for
//! tests. Remote share providers export the same two operations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use otto_core::{Error, ParamDict, ParamValue, Result, Status};

use crate::registry::{Service, ServiceContext};

/// File share mirrored onto a local directory.
///
/// Exports `upload` (local `from` -> share `to`) and `download`
/// (share `from` -> local `to`). Directories are copied recursively.
pub struct FileShareService {
    share_root: PathBuf,
}

impl FileShareService {
    pub fn new(share_root: impl Into<PathBuf>) -> Self {
        FileShareService {
            share_root: share_root.into(),
        }
    }

    fn endpoints(&self, params: &ParamDict) -> Result<(String, String)> {
        let get = |key: &str| -> Result<String> {
            params
                .get(key)
                .and_then(ParamValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::config(format!("missing file share parameter: {key}")))
        };
        Ok((get("from")?, get("to")?))
    }

    fn copy_tree(from: &Path, to: &Path) -> Result<()> {
        if from.is_dir() {
            std::fs::create_dir_all(to)?;
            for entry in std::fs::read_dir(from)? {
                let entry = entry?;
                Self::copy_tree(&entry.path(), &to.join(entry.file_name()))?;
            }
        } else {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(from, to)?;
            debug!(from = %from.display(), to = %to.display(), "copy");
        }
        Ok(())
    }
}

#[async_trait]
impl Service for FileShareService {
    fn exports(&self) -> Vec<&'static str> {
        vec!["upload", "download"]
    }

    async fn invoke(
        &self,
        _ctx: &ServiceContext<'_>,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        let (from, to) = self.endpoints(params)?;
        let (src, dst) = match op {
            "upload" => (PathBuf::from(&from), self.share_root.join(&to)),
            "download" => (self.share_root.join(&from), PathBuf::from(&to)),
            other => {
                return Err(Error::config(format!("unsupported operation: {other}")));
            }
        };
        info!(op, from = %src.display(), to = %dst.display(), "file share transfer");
        if !src.exists() {
            return Ok((Status::Failed, ParamDict::new()));
        }
        Self::copy_tree(&src, &dst)?;
        Ok((Status::Succeeded, params.clone()))
    }
}
