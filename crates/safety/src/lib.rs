use thiserror::Error;

/// Disk id refused unless the configuration says otherwise.
pub const DEFAULT_ROOT_DEVICE: &str = "sda";

const MAX_USERNAME_LEN: usize = 32;
const MAX_HOSTNAME_LEN: usize = 63;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("refusing to touch root device {0}; adjust root_devices in the configuration to override")]
    RootDevice(String),

    #[error("target devices were not confirmed by the operator")]
    NotConfirmed,

    #[error("sd card and thumb drive are the same device ({0})")]
    SameDevice(String),

    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub confirmed: bool,
    pub root_devices: Vec<String>,
}

impl Default for SafetyContext {
    fn default() -> Self {
        Self {
            confirmed: false,
            root_devices: vec![DEFAULT_ROOT_DEVICE.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

/// Rejects the call if any id is one of the reserved root devices. Ids are
/// compared exactly (a `/dev/` prefix is ignored), so `sda3` passes while
/// `sda` does not.
pub fn check_for_root_device<I, R>(ids: &[I], reserved: &[R]) -> Result<(), GuardError>
where
    I: AsRef<str>,
    R: AsRef<str>,
{
    for id in ids {
        let id = normalize(id.as_ref());
        if reserved.iter().any(|root| normalize(root.as_ref()) == id) {
            return Err(GuardError::RootDevice(id.to_string()));
        }
    }
    Ok(())
}

pub fn can_write_to_disks(ctx: &SafetyContext, sd_card: &str, thumb_drive: &str) -> SafetyDecision {
    match guard_targets(ctx, sd_card, thumb_drive) {
        Ok(()) => SafetyDecision::Allow,
        Err(err) => SafetyDecision::Deny(err.to_string()),
    }
}

fn guard_targets(ctx: &SafetyContext, sd_card: &str, thumb_drive: &str) -> Result<(), GuardError> {
    check_for_root_device(&[sd_card, thumb_drive], &ctx.root_devices)?;
    if normalize(sd_card) == normalize(thumb_drive) {
        return Err(GuardError::SameDevice(normalize(sd_card).to_string()));
    }
    if !ctx.confirmed {
        return Err(GuardError::NotConfirmed);
    }
    Ok(())
}

pub fn validate_username(user: &str) -> Result<(), GuardError> {
    let invalid = |reason: &str| GuardError::InvalidParameter {
        field: "username",
        reason: reason.to_string(),
    };
    let mut chars = user.chars();
    match chars.next() {
        None => return Err(invalid("must not be empty")),
        Some(first) if !(first.is_ascii_lowercase() || first == '_') => {
            return Err(invalid("must start with a lowercase letter or underscore"))
        }
        _ => {}
    }
    if user.len() > MAX_USERNAME_LEN {
        return Err(invalid("longer than 32 characters"));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(invalid("only lowercase letters, digits, '_' and '-' are allowed"));
    }
    Ok(())
}

pub fn validate_hostname(hostname: &str) -> Result<(), GuardError> {
    let invalid = |reason: &str| GuardError::InvalidParameter {
        field: "hostname",
        reason: reason.to_string(),
    };
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return Err(invalid("must be 1 to 63 characters"));
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid("only letters, digits and '-' are allowed"));
    }
    Ok(())
}

/// Wireless values end up inside double quotes in wpa_supplicant.conf.
pub fn validate_wireless(ssid: &str, psk: &str) -> Result<(), GuardError> {
    let quoted_safe = |value: &str| !value.chars().any(|c| c == '"' || c.is_control());
    if ssid.is_empty() || ssid.len() > 32 || !quoted_safe(ssid) {
        return Err(GuardError::InvalidParameter {
            field: "ssid",
            reason: "must be 1 to 32 bytes without quotes or control characters".to_string(),
        });
    }
    if !(8..=63).contains(&psk.len()) || !quoted_safe(psk) {
        return Err(GuardError::InvalidParameter {
            field: "psk",
            reason: "must be 8 to 63 characters without quotes or control characters".to_string(),
        });
    }
    Ok(())
}

fn normalize(id: &str) -> &str {
    id.strip_prefix("/dev/").unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(confirmed: bool) -> SafetyContext {
        SafetyContext {
            confirmed,
            ..SafetyContext::default()
        }
    }

    #[test]
    fn accepts_non_root_ids() {
        assert!(check_for_root_device(&["sdb", "mmcblk0"], &["sda"]).is_ok());
        assert!(check_for_root_device(&["sdb1", "sda3", "dd101202"], &["sda"]).is_ok());
        assert!(check_for_root_device::<&str, &str>(&[], &["sda"]).is_ok());
    }

    #[test]
    fn rejects_root_id_in_any_position() {
        for ids in [vec!["sda"], vec!["sdb", "sda"], vec!["sda", "sdb", "mmcblk0"], vec!["/dev/sda"]] {
            assert_eq!(
                check_for_root_device(&ids, &["sda"]),
                Err(GuardError::RootDevice("sda".to_string()))
            );
        }
    }

    #[test]
    fn reserved_set_is_configurable() {
        let reserved = vec!["nvme0n1".to_string()];
        assert!(check_for_root_device(&["sda"], &reserved).is_ok());
        assert!(check_for_root_device(&["nvme0n1"], &reserved).is_err());
    }

    #[test]
    fn denies_without_confirmation() {
        assert!(matches!(
            can_write_to_disks(&ctx(false), "mmcblk0", "sdb"),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn denies_root_even_when_confirmed() {
        assert!(matches!(
            can_write_to_disks(&ctx(true), "mmcblk0", "sda"),
            SafetyDecision::Deny(reason) if reason.contains("root device sda")
        ));
    }

    #[test]
    fn denies_same_device_twice() {
        assert!(matches!(
            can_write_to_disks(&ctx(true), "sdb", "/dev/sdb"),
            SafetyDecision::Deny(_)
        ));
    }

    #[test]
    fn allows_confirmed_distinct_targets() {
        assert_eq!(
            can_write_to_disks(&ctx(true), "mmcblk0", "sdb"),
            SafetyDecision::Allow
        );
    }

    #[test]
    fn usernames() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("_svc-1").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("1pi").is_err());
        assert!(validate_username("pi/../root").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn hostnames() {
        assert!(validate_hostname("pi-lab").is_ok());
        assert!(validate_hostname("Pi3").is_ok());
        assert!(validate_hostname("-pi").is_err());
        assert!(validate_hostname("pi.local").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn wireless() {
        assert!(validate_wireless("home net", "correct horse").is_ok());
        assert!(validate_wireless("", "correct horse").is_err());
        assert!(validate_wireless("home", "short").is_err());
        assert!(validate_wireless("home\"}", "correct horse").is_err());
        assert!(validate_wireless("home", "line\nbreak!").is_err());
    }
}
