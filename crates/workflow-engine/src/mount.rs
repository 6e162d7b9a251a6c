use crate::path_arg;
use anyhow::{Context, Result};
use raspi_exec::{CommandRequest, CommandRunner};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A partition mounted at `<base>/raspi-<role>-<uuid>`.
///
/// There is no `Drop` cleanup: a stage that fails with the partition mounted
/// leaves it there so the operator can look at it during recovery.
pub(crate) struct ScratchMount<'a> {
    runner: &'a dyn CommandRunner,
    dir: PathBuf,
}

impl<'a> ScratchMount<'a> {
    pub(crate) fn mount(
        runner: &'a dyn CommandRunner,
        base: &Path,
        role: &str,
        partition: &str,
    ) -> Result<Self> {
        let dir = base.join(format!("raspi-{}-{}", role, Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("create mount point {}", dir.display()))?;
        let dir_arg = path_arg(&dir);
        runner
            .run(&CommandRequest::batch(["mount", partition, dir_arg.as_str()]).privileged())
            .with_context(|| format!("mount {} at {}", partition, dir.display()))?;
        Ok(Self { runner, dir })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.join(relative)
    }

    pub(crate) fn release(self) -> Result<()> {
        let dir_arg = path_arg(&self.dir);
        self.runner
            .run(&CommandRequest::batch(["umount", dir_arg.as_str()]).privileged())
            .with_context(|| format!("unmount {}", self.dir.display()))?;
        fs::remove_dir(&self.dir)
            .with_context(|| format!("remove mount point {}", self.dir.display()))?;
        Ok(())
    }
}
