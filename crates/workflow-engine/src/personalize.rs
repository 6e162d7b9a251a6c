use crate::containment::StageContext;
use crate::edits::{
    autologin_expressions, fstab_expressions, group_expressions, host_key_comment_expressions,
    hostname_expressions, passwd_expressions, password_login_expressions, sed_in_place,
    shadow_expressions, sudoers_expressions,
};
use crate::mount::ScratchMount;
use crate::pipeline::ProvisionParams;
use crate::path_arg;
use crate::stages::unmount;
use anyhow::{anyhow, Context, Result};
use raspi_content::WirelessConfig;
use raspi_exec::{CommandRequest, CommandRunner};
use raspi_host_linux::BlockDevice;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// uid:gid of the image's default account.
const DEFAULT_ACCOUNT_OWNER: &str = "1000:1000";
const SSH_UNIT: &str = "/lib/systemd/system/ssh.service";
const WPA_SUPPLICANT_CONF: &str = "etc/wpa_supplicant/wpa_supplicant.conf";

pub(crate) fn personalize(
    device: &BlockDevice,
    params: &ProvisionParams,
    ctx: &mut StageContext,
) -> Result<()> {
    unmount(device, ctx)?;
    let root = device
        .partitions(true)?
        .pop()
        .ok_or_else(|| anyhow!("{} has no root partition to personalize", device.path()))?;
    let runner = device.runner();
    let mount = ScratchMount::mount(runner, &params.scratch_base, "root", root.as_str())?;
    ctx.note(format!("mounted {} at {}", root, mount.path().display()));

    let old_user = params.image_defaults.user.as_str();
    let old_host = params.image_defaults.hostname.as_str();
    let wanted = &params.personalization;

    run(runner, sed_in_place(&password_login_expressions(), &[mount.join("etc/ssh/sshd_config")]))?;
    ctx.note("disabled ssh password login");

    install_public_key(runner, &mount, old_user, &params.operator.public_key)?;
    ctx.note(format!("installed {}", params.operator.public_key.display()));

    if let Some(wireless) = &wanted.wireless {
        add_network(runner, &mount, wireless, &params.operator.user)?;
        ctx.note(format!("added wireless network {}", wireless.ssid));
    }

    rename_user(runner, &mount, old_user, &wanted.user, ctx)?;
    rename_host(runner, &mount, old_host, &wanted.hostname, ctx)?;

    run(
        runner,
        sed_in_place(
            &fstab_expressions(&params.target.boot_device, &params.target.root_device),
            &[mount.join("etc/fstab")],
        ),
    )?;
    ctx.note(format!(
        "fstab mounts {} on /boot and {} on /",
        params.target.boot_device, params.target.root_device
    ));

    let wants = mount.join("etc/systemd/system/multi-user.target.wants/ssh.service");
    run(runner, root_cmd(["ln", "-sf", SSH_UNIT, path_arg(&wants).as_str()]))?;
    ctx.note("enabled ssh at boot");

    mount.release()?;
    Ok(())
}

fn install_public_key(
    runner: &dyn CommandRunner,
    mount: &ScratchMount<'_>,
    account: &str,
    public_key: &Path,
) -> Result<()> {
    let ssh_dir = mount.join(format!("home/{}/.ssh", account));
    let authorized = ssh_dir.join("authorized_keys");
    let ssh_dir = path_arg(&ssh_dir);
    let authorized = path_arg(&authorized);

    run(runner, root_cmd(["mkdir", "-p", ssh_dir.as_str()]))?;
    run(runner, root_cmd(["cp", path_arg(public_key).as_str(), authorized.as_str()]))?;
    run(runner, root_cmd(["chown", "-R", DEFAULT_ACCOUNT_OWNER, ssh_dir.as_str()]))?;
    run(runner, root_cmd(["chmod", "700", ssh_dir.as_str()]))?;
    run(runner, root_cmd(["chmod", "600", authorized.as_str()]))?;
    Ok(())
}

/// Appends a network block while the file belongs to `operator`. Ownership
/// goes back to root even if the append fails.
fn add_network(
    runner: &dyn CommandRunner,
    mount: &ScratchMount<'_>,
    wireless: &WirelessConfig,
    operator: &str,
) -> Result<()> {
    let conf = mount.join(WPA_SUPPLICANT_CONF);
    let conf_arg = path_arg(&conf);
    run(runner, root_cmd(["chown", operator, conf_arg.as_str()]))?;

    let appended = append_network_block(&conf, wireless);
    let restored = run(runner, root_cmd(["chown", "root:root", conf_arg.as_str()]));

    appended.with_context(|| format!("append network to {}", conf.display()))?;
    restored
}

fn append_network_block(conf: &Path, wireless: &WirelessConfig) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(conf)?;
    file.write_all(network_block(wireless).as_bytes())?;
    file.flush()?;
    Ok(())
}

fn network_block(wireless: &WirelessConfig) -> String {
    format!(
        "\nnetwork={{\n    ssid=\"{}\"\n    psk=\"{}\"\n}}\n",
        wireless.ssid, wireless.psk
    )
}

fn rename_user(
    runner: &dyn CommandRunner,
    mount: &ScratchMount<'_>,
    old: &str,
    new: &str,
    ctx: &mut StageContext,
) -> Result<()> {
    if old == new {
        ctx.note(format!("keeping account {}", old));
        return Ok(());
    }

    run(runner, sed_in_place(&passwd_expressions(old, new), &[mount.join("etc/passwd")]))?;
    run(runner, sed_in_place(&shadow_expressions(old, new), &[mount.join("etc/shadow")]))?;
    run(
        runner,
        sed_in_place(
            &group_expressions(old, new),
            &[mount.join("etc/group"), mount.join("etc/gshadow")],
        ),
    )?;

    let sudoers = mount.join(format!("etc/sudoers.d/010_{}-nopasswd", old));
    if sudoers.is_file() {
        let renamed = mount.join(format!("etc/sudoers.d/010_{}-nopasswd", new));
        run(runner, sed_in_place(&sudoers_expressions(old, new), &[sudoers.clone()]))?;
        run(
            runner,
            root_cmd(["mv", path_arg(&sudoers).as_str(), path_arg(&renamed).as_str()]),
        )?;
    } else {
        ctx.note(format!("no sudoers entry for {}", old));
    }

    let autologin = mount.join("etc/systemd/system/autologin@.service");
    if autologin.is_file() {
        run(runner, sed_in_place(&autologin_expressions(old, new), &[autologin]))?;
    }

    let old_home = mount.join(format!("home/{}", old));
    if old_home.is_dir() {
        let new_home = mount.join(format!("home/{}", new));
        run(
            runner,
            root_cmd(["mv", path_arg(&old_home).as_str(), path_arg(&new_home).as_str()]),
        )?;
    }
    ctx.note(format!("renamed account {} to {}", old, new));
    Ok(())
}

fn rename_host(
    runner: &dyn CommandRunner,
    mount: &ScratchMount<'_>,
    old: &str,
    new: &str,
    ctx: &mut StageContext,
) -> Result<()> {
    if old == new {
        ctx.note(format!("keeping hostname {}", old));
        return Ok(());
    }
    run(
        runner,
        sed_in_place(
            &hostname_expressions(old, new),
            &[mount.join("etc/hostname"), mount.join("etc/hosts")],
        ),
    )?;

    let keys = host_public_keys(&mount.join("etc/ssh"))?;
    if !keys.is_empty() {
        run(runner, sed_in_place(&host_key_comment_expressions(old, new), &keys))?;
    }
    ctx.note(format!("renamed host {} to {} ({} host keys)", old, new, keys.len()));
    Ok(())
}

fn host_public_keys(ssh_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(ssh_dir).with_context(|| format!("read {}", ssh_dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("ssh_host_") && name.ends_with(".pub") {
            keys.push(entry.path());
        }
    }
    keys.sort();
    Ok(keys)
}

fn root_cmd<const N: usize>(argv: [&str; N]) -> CommandRequest {
    CommandRequest::batch(argv).privileged()
}

fn run(runner: &dyn CommandRunner, request: CommandRequest) -> Result<()> {
    runner.run(&request)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Rig;
    use crate::Stage;

    fn personalize_rig() -> Rig {
        let rig = Rig::new();
        rig.set_layout("sdb", &[(2, 137216, 31266815)]);
        rig
    }

    fn run_stage(rig: &Rig) -> Result<StageContext> {
        let mut ctx = StageContext::new(Stage::PersonalizeRoot);
        personalize(&rig.thumb, &rig.params, &mut ctx)?;
        Ok(ctx)
    }

    fn position(rendered: &[String], needle: &str) -> usize {
        rendered
            .iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no command containing {needle:?} in {rendered:#?}"))
    }

    #[test]
    fn mounts_root_partition_and_cleans_up() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let mount = &rig.fake.calls_matching(&["mount"])[0];
        assert_eq!(mount[1], "/dev/sdb2");
        assert!(mount[2].contains("/raspi-root-"));
        assert!(rig.scratch_entries().is_empty());
    }

    #[test]
    fn wireless_append_happens_between_ownership_changes() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let rendered = rig.fake.rendered();
        let relax = position(&rendered, "chown operator ");
        let restore = position(&rendered, "chown root:root ");
        assert!(relax < restore);
        assert!(rendered[relax].ends_with("etc/wpa_supplicant/wpa_supplicant.conf"));

        let written = rig.wpa_contents().unwrap();
        assert_eq!(
            written,
            "country=GB\n\nnetwork={\n    ssid=\"home\"\n    psk=\"correct horse\"\n}\n"
        );
    }

    #[test]
    fn ownership_is_restored_when_append_fails() {
        let rig = personalize_rig();
        rig.omit_wpa_conf();
        let err = run_stage(&rig).err().unwrap();
        assert!(format!("{err:#}").contains("append network to"));
        let rendered = rig.fake.rendered();
        assert!(position(&rendered, "chown operator ") < position(&rendered, "chown root:root "));
        assert_eq!(rig.scratch_entries().len(), 1);
    }

    #[test]
    fn no_wireless_means_no_network_block() {
        let mut rig = personalize_rig();
        rig.params.personalization.wireless = None;
        run_stage(&rig).unwrap();
        assert!(rig.fake.rendered().iter().all(|line| !line.contains("wpa_supplicant")));
        assert!(rig.wpa_contents().is_none());
    }

    #[test]
    fn public_key_lands_in_default_account_before_rename() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let rendered = rig.fake.rendered();
        let key = rig.params.operator.public_key.to_string_lossy().into_owned();
        let copy = position(&rendered, &format!("cp {} ", key));
        assert!(rendered[copy].ends_with("/home/pi/.ssh/authorized_keys"));
        assert!(position(&rendered, "chmod 700 ") > copy);
        assert!(rendered[position(&rendered, "chmod 600 ")].ends_with("authorized_keys"));
        assert!(copy < position(&rendered, "/home/alice"));
    }

    #[test]
    fn renames_account_everywhere() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let seds = rig.fake.calls_matching(&["sed"]);
        let touched: Vec<&str> = seds
            .iter()
            .flat_map(|argv| argv.iter().filter(|arg| arg.starts_with('/')))
            .map(String::as_str)
            .collect();
        for file in ["etc/passwd", "etc/shadow", "etc/group", "etc/gshadow", "etc/sudoers.d/010_pi-nopasswd", "etc/systemd/system/autologin@.service"] {
            assert!(touched.iter().any(|path| path.ends_with(file)), "{file} not edited");
        }
        let moves = rig.fake.calls_matching(&["mv"]);
        assert_eq!(moves.len(), 2);
        assert!(moves[0][2].ends_with("etc/sudoers.d/010_alice-nopasswd"));
        assert!(moves[1][1].ends_with("home/pi"));
        assert!(moves[1][2].ends_with("home/alice"));
    }

    #[test]
    fn keeping_default_names_skips_renames() {
        let mut rig = personalize_rig();
        rig.params.personalization.user = "pi".to_string();
        rig.params.personalization.hostname = "raspberrypi".to_string();
        let ctx = run_stage(&rig).unwrap();
        assert!(rig.fake.calls_matching(&["mv"]).is_empty());
        let rendered = rig.fake.rendered();
        assert!(rendered.iter().all(|line| !line.ends_with("etc/passwd")));
        assert!(rendered.iter().all(|line| !line.ends_with("etc/hosts")));
        assert!(ctx.notes().contains(&"keeping account pi".to_string()));
    }

    #[test]
    fn host_key_comments_cover_every_public_key() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let seds = rig.fake.calls_matching(&["sed"]);
        let keys = seds
            .iter()
            .find(|argv| argv.contains(&"s/@raspberrypi$/@pi-lab/".to_string()))
            .unwrap();
        let files: Vec<&String> = keys.iter().filter(|arg| arg.starts_with('/')).collect();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("etc/ssh/ssh_host_ecdsa_key.pub"));
        assert!(files[1].ends_with("etc/ssh/ssh_host_rsa_key.pub"));
    }

    #[test]
    fn fstab_and_ssh_service() {
        let rig = personalize_rig();
        run_stage(&rig).unwrap();
        let rendered = rig.fake.rendered();
        let fstab = &rendered[position(&rendered, "etc/fstab")];
        assert!(fstab.contains(r"\/dev\/mmcblk0p1"));
        assert!(fstab.contains(r"\/dev\/sda2"));
        let link = rig.fake.calls_matching(&["ln"]);
        assert_eq!(link.len(), 1);
        assert_eq!(link[0][2], SSH_UNIT);
        assert!(link[0][3].ends_with("etc/systemd/system/multi-user.target.wants/ssh.service"));
        assert!(position(&rendered, "ln -sf") < rendered.len() - 1);
        assert!(rendered.last().unwrap().starts_with("umount "));
    }
}
