use crate::containment::StageContext;
use crate::edits::{cmdline_expressions, sed_in_place};
use crate::mount::ScratchMount;
use crate::path_arg;
use anyhow::{anyhow, bail, Context, Result};
use raspi_exec::{shell_quote, CommandRequest};
use raspi_host_linux::BlockDevice;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ClearSdCard,
    ClearThumbDrive,
    FlashThumbDrive,
    CopyBootPartition,
    PatchBootConfig,
    ExpandRootPartition,
    PersonalizeRoot,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 7] = [
        Stage::ClearSdCard,
        Stage::ClearThumbDrive,
        Stage::FlashThumbDrive,
        Stage::CopyBootPartition,
        Stage::PatchBootConfig,
        Stage::ExpandRootPartition,
        Stage::PersonalizeRoot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::ClearSdCard => "clear_sd_card",
            Stage::ClearThumbDrive => "clear_thumb_drive",
            Stage::FlashThumbDrive => "flash_thumb_drive",
            Stage::CopyBootPartition => "copy_boot_partition",
            Stage::PatchBootConfig => "patch_boot_config",
            Stage::ExpandRootPartition => "expand_root_partition",
            Stage::PersonalizeRoot => "personalize_root",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn clear(device: &BlockDevice, ctx: &mut StageContext) -> Result<()> {
    unmount(device, ctx)?;

    let mut numbers = device
        .partition_numbers()
        .with_context(|| format!("read partition table of {}", device.path()))?;
    // Highest first so the numbers still to be deleted stay valid.
    numbers.sort_unstable_by(|a, b| b.cmp(a));
    numbers.dedup();

    for number in numbers {
        let number_arg = number.to_string();
        device
            .runner()
            .run(&CommandRequest::interactive(["parted", device.path(), "rm", number_arg.as_str()]).privileged())
            .with_context(|| format!("delete {} partition #{}", device.path(), number))?;
        ctx.note(format!("deleted {} partition #{}", device.path(), number));
    }

    let left = device.partitions(false)?;
    if !left.is_empty() {
        let names: Vec<&str> = left.iter().map(|partition| partition.as_str()).collect();
        bail!("{} still has partitions after clearing: {}", device.path(), names.join(", "));
    }
    Ok(())
}

pub(crate) fn flash(image: &Path, device: &BlockDevice, ctx: &mut StageContext) -> Result<()> {
    unmount(device, ctx)?;

    let script = copy_pipeline(&path_arg(image), device.path());
    device
        .runner()
        .run(&CommandRequest::shell(script).privileged())
        .with_context(|| format!("write {} to {}", image.display(), device.path()))?;
    ctx.note(format!("wrote {} to {}", image.display(), device.path()));

    device
        .runner()
        .run(&CommandRequest::batch(["partprobe", device.path()]).privileged())
        .with_context(|| format!("re-read partition table of {}", device.path()))?;

    let partitions = device.partitions(false)?;
    if partitions.is_empty() {
        bail!("{} shows no partitions after flashing", device.path());
    }
    ctx.note(format!("{} now has {} partitions", device.path(), partitions.len()));
    Ok(())
}

/// Recreates `source` partition #1 on `target` at the same sectors and copies it byte for byte.
pub(crate) fn copy_boot_partition(
    source: &BlockDevice,
    target: &BlockDevice,
    ctx: &mut StageContext,
) -> Result<()> {
    unmount(source, ctx)?;
    unmount(target, ctx)?;

    let boot = source
        .partition_spec(1)
        .with_context(|| format!("read boot partition of {}", source.path()))?;
    ensure_partition_table(target, ctx)?;
    target
        .runner()
        .run(
            &CommandRequest::interactive([
                "parted",
                target.path(),
                "mkpart",
                "primary",
                "fat16",
                boot.start.as_str(),
                boot.end.as_str(),
            ])
            .privileged(),
        )
        .with_context(|| format!("create boot partition on {}", target.path()))?;
    ctx.note(format!(
        "created fat16 partition {}..{} on {}",
        boot.start,
        boot.end,
        target.path()
    ));

    let from = first_partition(source)?;
    let to = first_partition(target)?;
    target
        .runner()
        .run(&CommandRequest::shell(copy_pipeline(&from, &to)).privileged())
        .with_context(|| format!("copy {} to {}", from, to))?;
    ctx.note(format!("copied {} to {}", from, to));

    target
        .runner()
        .run(&CommandRequest::batch(["fatlabel", to.as_str(), "boot"]).privileged())
        .with_context(|| format!("label {}", to))?;
    ctx.note(format!("labelled {} boot", to));
    Ok(())
}

/// Writes an msdos label when the target has none, since `mkpart` needs a table to add to.
fn ensure_partition_table(device: &BlockDevice, ctx: &mut StageContext) -> Result<()> {
    let kind = device
        .partition_table_kind()
        .with_context(|| format!("read partition table of {}", device.path()))?;
    if kind.is_some() {
        return Ok(());
    }
    device
        .runner()
        .run(&CommandRequest::interactive(["parted", device.path(), "mklabel", "msdos"]).privileged())
        .with_context(|| format!("create partition table on {}", device.path()))?;
    ctx.note(format!("created msdos partition table on {}", device.path()));
    Ok(())
}

pub(crate) fn patch_boot_config(
    device: &BlockDevice,
    scratch_base: &Path,
    root_device: &str,
    ctx: &mut StageContext,
) -> Result<()> {
    let boot = first_partition(device)?;
    let mount = ScratchMount::mount(device.runner(), scratch_base, "boot", &boot)?;
    ctx.note(format!("mounted {} at {}", boot, mount.path().display()));

    let cmdline = mount.join("cmdline.txt");
    device
        .runner()
        .run(&sed_in_place(&cmdline_expressions(root_device), &[cmdline.clone()]))
        .with_context(|| format!("rewrite {}", cmdline.display()))?;
    ctx.note(format!("pointed root= at {} and removed init_resize", root_device));

    mount.release()?;
    Ok(())
}

/// Drops the leftover boot partition from the thumb drive and grows the root
/// partition and its file system over the whole device.
pub(crate) fn expand_root_partition(device: &BlockDevice, ctx: &mut StageContext) -> Result<()> {
    unmount(device, ctx)?;

    device
        .runner()
        .run(&CommandRequest::interactive(["parted", device.path(), "rm", "1"]).privileged())
        .with_context(|| format!("delete {} partition #1", device.path()))?;
    ctx.note(format!("deleted {} partition #1", device.path()));

    // Numbers and names are read back rather than assumed: msdos tables keep
    // the old number, other layouts may renumber.
    let numbers = device.partition_numbers()?;
    let [root] = numbers[..] else {
        bail!(
            "expected exactly one partition on {} after removing #1, found {}",
            device.path(),
            numbers.len()
        );
    };
    let number_arg = root.to_string();
    device
        .runner()
        .run(
            &CommandRequest::interactive(["parted", device.path(), "resizepart", number_arg.as_str(), "100%"])
                .privileged(),
        )
        .with_context(|| format!("grow {} partition #{}", device.path(), root))?;
    ctx.note(format!("grew {} partition #{} to 100%", device.path(), root));

    let partitions = device.partitions(true)?;
    let [partition] = partitions.as_slice() else {
        bail!(
            "expected exactly one partition on {}, found {}",
            device.path(),
            partitions.len()
        );
    };
    let partition = partition.as_str();

    // e2fsck exits 1 when it corrected errors, which is what -y asks for.
    device
        .runner()
        .run(
            &CommandRequest::interactive(["e2fsck", "-f", "-y", partition])
                .privileged()
                .accept_exit_codes(&[0, 1]),
        )
        .with_context(|| format!("check {}", partition))?;
    ctx.note(format!("checked {}", partition));

    device
        .runner()
        .run(&CommandRequest::interactive(["resize2fs", partition]).privileged())
        .with_context(|| format!("resize file system on {}", partition))?;
    ctx.note(format!("resized file system on {}", partition));
    Ok(())
}

pub(crate) fn unmount(device: &BlockDevice, ctx: &mut StageContext) -> Result<()> {
    let unmounted = device
        .unmount_all()
        .with_context(|| format!("unmount {}", device.path()))?;
    if !unmounted.is_empty() {
        ctx.note(format!("unmounted {}", unmounted.join(", ")));
    }
    Ok(())
}

fn first_partition(device: &BlockDevice) -> Result<String> {
    device
        .partitions(true)?
        .into_iter()
        .next()
        .map(|partition| partition.name)
        .ok_or_else(|| anyhow!("{} has no partitions", device.path()))
}

fn copy_pipeline(from: &str, to: &str) -> String {
    format!("dd if={} | pv | dd of={}", shell_quote(from), shell_quote(to))
}
