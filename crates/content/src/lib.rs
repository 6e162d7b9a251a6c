use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "raspi-maker.yaml";
pub const DEFAULT_IMAGE_NAME: &str = "2018-10-09-raspbian-stretch-lite.img";
pub const DEFAULT_IMAGE_DIR: &str = "~/Documents";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub sd_card: Option<String>,
    pub thumb_drive: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirelessConfig {
    pub ssid: String,
    pub psk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub path: Option<PathBuf>,
    pub name: String,
    pub search_dir: PathBuf,
    pub sha256: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            path: None,
            name: DEFAULT_IMAGE_NAME.to_string(),
            search_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            sha256: None,
        }
    }
}

/// Device paths as the Raspberry Pi sees them after boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub boot_device: String,
    pub root_device: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            boot_device: "/dev/mmcblk0p1".to_string(),
            root_device: "/dev/sda2".to_string(),
        }
    }
}

/// Account and host name the stock image ships with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDefaultsConfig {
    pub user: String,
    pub hostname: String,
}

impl Default for ImageDefaultsConfig {
    fn default() -> Self {
        Self {
            user: "pi".to_string(),
            hostname: "raspberrypi".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaspiConfig {
    pub devices: DeviceConfig,
    pub wireless: Option<WirelessConfig>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub image: ImageConfig,
    pub root_devices: Vec<String>,
    pub target: TargetConfig,
    pub image_defaults: ImageDefaultsConfig,
    pub public_key: Option<PathBuf>,
    pub use_sudo: bool,
    pub report_dir: PathBuf,
}

impl Default for RaspiConfig {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            wireless: None,
            user: None,
            hostname: None,
            image: ImageConfig::default(),
            root_devices: vec![raspi_safety::DEFAULT_ROOT_DEVICE.to_string()],
            target: TargetConfig::default(),
            image_defaults: ImageDefaultsConfig::default(),
            public_key: None,
            use_sudo: true,
            report_dir: PathBuf::from("."),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<RaspiConfig> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: RaspiConfig = serde_yaml::from_str(&data)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

/// An explicit path must exist. Without one, `./raspi-maker.yaml` is read
/// when present and defaults are used otherwise.
pub fn resolve_config(explicit: Option<&Path>) -> Result<RaspiConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                load_config(default)
            } else {
                Ok(RaspiConfig::default())
            }
        }
    }
}

/// Expands a leading `~` against `home`. Other paths are returned as given.
pub fn expand_home(path: &Path, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

pub fn locate_image(config: &ImageConfig, home: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = &config.path {
        let path = expand_home(path, home);
        if path.is_file() {
            return Ok(path);
        }
        return Err(anyhow!("image {} does not exist", path.display()));
    }
    let candidate = expand_home(&config.search_dir, home).join(&config.name);
    if candidate.is_file() {
        return Ok(candidate);
    }
    Err(anyhow!(
        "image {} not found; download it or set image.path",
        candidate.display()
    ))
}
