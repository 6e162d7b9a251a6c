//! `sed -E -i` expression builders for the files edited inside mounted images.
//!
//! Everything is written with `#` or `/` delimiters and both sides escaped, so a
//! device path or name can be substituted in without extra quoting. Requests are
//! argv vectors; no shell sees these strings.

use crate::path_arg;
use raspi_exec::CommandRequest;
use std::path::PathBuf;

pub(crate) fn sed_in_place(expressions: &[String], files: &[PathBuf]) -> CommandRequest {
    let mut argv = vec!["sed".to_string(), "-i".to_string(), "-E".to_string()];
    for expression in expressions {
        argv.push("-e".to_string());
        argv.push(expression.clone());
    }
    argv.extend(files.iter().map(|file| path_arg(file)));
    CommandRequest::batch(argv).privileged()
}

/// Escapes ERE metacharacters and the `#` and `/` delimiters.
pub(crate) fn escape_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if r"\.[]()*+?{}|^$#/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub(crate) fn escape_replacement(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if r"\&#/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Points `root=` at `root_device` and drops the first-boot resize hook, which
/// would otherwise resize the SD card instead of the thumb drive.
pub(crate) fn cmdline_expressions(root_device: &str) -> Vec<String> {
    vec![
        format!("s#root=[^ ]+#root={}#", escape_replacement(root_device)),
        r"s# ?init=[^ ]*init_resize\.sh##".to_string(),
    ]
}

pub(crate) fn password_login_expressions() -> Vec<String> {
    vec!["s/^#?PasswordAuthentication .*/PasswordAuthentication no/".to_string()]
}

/// `/etc/passwd`: account name and home directory.
pub(crate) fn passwd_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![
        format!("s/^{o}:/{n}:/"),
        format!("s#:\\/home\\/{o}:#:/home/{n}:#"),
    ]
}

/// `/etc/shadow`: account name only.
pub(crate) fn shadow_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![format!("s/^{o}:/{n}:/")]
}

/// `/etc/group` and `/etc/gshadow`: the user's own group and every member list.
pub(crate) fn group_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![
        format!("s/^{o}:/{n}:/"),
        format!("s/([:,]){o}(,|$)/\\1{n}\\2/g"),
    ]
}

pub(crate) fn sudoers_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![format!("s/^{o} /{n} /")]
}

pub(crate) fn autologin_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![format!("s/--autologin {o}( |$)/--autologin {n}\\1/")]
}

/// `/etc/hostname` and `/etc/hosts`.
pub(crate) fn hostname_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![format!("s/\\b{o}\\b/{n}/g")]
}

/// `user@host` comments at the end of the SSH host public keys.
pub(crate) fn host_key_comment_expressions(old: &str, new: &str) -> Vec<String> {
    let (o, n) = (escape_pattern(old), escape_replacement(new));
    vec![format!("s/@{o}$/@{n}/")]
}

/// Replaces `PARTUUID=`/`UUID=` sources of the `/boot` and `/` entries with
/// static device paths. The image's UUIDs describe the disk it was built on.
pub(crate) fn fstab_expressions(boot_device: &str, root_device: &str) -> Vec<String> {
    let (boot, root) = (escape_replacement(boot_device), escape_replacement(root_device));
    vec![
        format!("s#^(PART)?UUID=[^[:space:]]+([[:space:]]+/boot[[:space:]])#{boot}\\2#"),
        format!("s#^(PART)?UUID=[^[:space:]]+([[:space:]]+/[[:space:]])#{root}\\2#"),
    ]
}
