//! Runtime configuration for platform/device selection and program builds.
//!
//! Loads [`OclConfig`] from a TOML file (`oclkit.toml`) with environment
//! variable overrides via `OCLKIT_*` prefixed variables.

use crate::driver::DeviceType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Category of device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Default,
    Cpu,
    Gpu,
    Accelerator,
    All,
}

impl DeviceKind {
    /// The OpenCL device-type bitmask for this kind.
    pub fn device_type(self) -> DeviceType {
        match self {
            Self::Default => DeviceType::DEFAULT,
            Self::Cpu => DeviceType::CPU,
            Self::Gpu => DeviceType::GPU,
            Self::Accelerator => DeviceType::ACCELERATOR,
            Self::All => DeviceType::ALL,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "accelerator" => Ok(Self::Accelerator),
            "all" => Ok(Self::All),
            other => Err(format!("unknown device kind: {other}")),
        }
    }
}

/// Configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OclConfig {
    /// Platform to open by exact name; empty selects the first platform.
    /// Override: `OCLKIT_PLATFORM`
    pub platform_name: String,

    /// Device category to enumerate on the selected platform.
    /// Override: `OCLKIT_DEVICE_TYPE`
    pub device_type: DeviceKind,

    /// Base compiler options passed to every program build.
    /// Override: `OCLKIT_BUILD_OPTIONS`
    pub build_options: String,

    /// Directories searched for kernel sources and passed as `-I` flags.
    /// Override: `OCLKIT_INCLUDE_PATH` (platform path-list syntax)
    pub include_paths: Vec<PathBuf>,

    /// Capture kernel argument names at build time.
    /// Override: `OCLKIT_KERNEL_ARG_INFO`
    pub kernel_arg_info: bool,

    /// Open command queues with profiling enabled.
    /// Override: `OCLKIT_QUEUE_PROFILING`
    pub queue_profiling: bool,
}

impl Default for OclConfig {
    fn default() -> Self {
        Self {
            platform_name: String::new(),
            device_type: DeviceKind::Gpu,
            build_options: String::new(),
            include_paths: Vec::new(),
            kernel_arg_info: true,
            queue_profiling: false,
        }
    }
}

/// Errors that can occur when loading or validating an [`OclConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl OclConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: OclConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platform_name.contains('\0') {
            return Err(ConfigError::Validation(
                "platform_name must not contain NUL".into(),
            ));
        }
        if self.build_options.contains('\0') {
            return Err(ConfigError::Validation(
                "build_options must not contain NUL".into(),
            ));
        }
        if self.build_options.contains("-cl-kernel-arg-info") {
            return Err(ConfigError::Validation(
                "use kernel_arg_info instead of passing -cl-kernel-arg-info in build_options"
                    .into(),
            ));
        }
        if let Some(path) = self.include_paths.iter().find(|p| p.as_os_str().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "include_paths must not contain empty entries: {path:?}"
            )));
        }
        Ok(())
    }

    /// Apply `OCLKIT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("OCLKIT_PLATFORM") {
            self.platform_name = val;
        }

        if let Ok(val) = std::env::var("OCLKIT_DEVICE_TYPE") {
            self.device_type = val.parse::<DeviceKind>().map_err(|reason| {
                ConfigError::EnvOverride {
                    key: "OCLKIT_DEVICE_TYPE".into(),
                    value: val.clone(),
                    reason,
                }
            })?;
        }

        if let Ok(val) = std::env::var("OCLKIT_BUILD_OPTIONS") {
            self.build_options = val;
        }

        if let Some(val) = std::env::var_os("OCLKIT_INCLUDE_PATH") {
            self.include_paths = std::env::split_paths(&val)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("OCLKIT_KERNEL_ARG_INFO") {
            self.kernel_arg_info = parse_flag("OCLKIT_KERNEL_ARG_INFO", &val)?;
        }

        if let Ok(val) = std::env::var("OCLKIT_QUEUE_PROFILING") {
            self.queue_profiling = parse_flag("OCLKIT_QUEUE_PROFILING", &val)?;
        }

        Ok(())
    }
}

fn parse_flag(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean (1/0, true/false, yes/no, on/off)".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: [(&str, Option<&str>); 6] = [
        ("OCLKIT_PLATFORM", None),
        ("OCLKIT_DEVICE_TYPE", None),
        ("OCLKIT_BUILD_OPTIONS", None),
        ("OCLKIT_INCLUDE_PATH", None),
        ("OCLKIT_KERNEL_ARG_INFO", None),
        ("OCLKIT_QUEUE_PROFILING", None),
    ];

    #[test]
    fn test_default_config_is_valid() {
        assert!(OclConfig::default().validate().is_ok());
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_default_toml_round_trips() {
        temp_env::with_vars(ALL_VARS, || {
            let toml_str = OclConfig::default_toml().unwrap();
            let cfg = OclConfig::from_toml(&toml_str).unwrap();
            assert_eq!(cfg, OclConfig::default());
        });
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_from_toml_full() {
        temp_env::with_vars(ALL_VARS, || {
            let toml_str = r#"
platform_name = "Intel(R) OpenCL"
device_type = "cpu"
build_options = "-cl-fast-relaxed-math -DTILE=16"
include_paths = ["kernels", "/opt/cl/include"]
kernel_arg_info = false
queue_profiling = true
"#;
            let cfg = OclConfig::from_toml(toml_str).unwrap();
            assert_eq!(cfg.platform_name, "Intel(R) OpenCL");
            assert_eq!(cfg.device_type, DeviceKind::Cpu);
            assert_eq!(cfg.build_options, "-cl-fast-relaxed-math -DTILE=16");
            assert_eq!(
                cfg.include_paths,
                vec![PathBuf::from("kernels"), PathBuf::from("/opt/cl/include")]
            );
            assert!(!cfg.kernel_arg_info);
            assert!(cfg.queue_profiling);
        });
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_missing_fields_take_defaults() {
        temp_env::with_vars(ALL_VARS, || {
            let cfg = OclConfig::from_toml("device_type = \"all\"").unwrap();
            assert_eq!(cfg.device_type, DeviceKind::All);
            assert!(cfg.kernel_arg_info);
            assert!(cfg.include_paths.is_empty());
        });
    }

    #[test]
    fn test_unknown_device_type_is_parse_error() {
        let err = toml::from_str::<OclConfig>("device_type = \"fpga\"").unwrap_err();
        assert!(err.to_string().contains("fpga"));
    }

    #[test]
    fn test_validation_rejects_arg_info_in_options() {
        let cfg = OclConfig {
            build_options: "-O2 -cl-kernel-arg-info".into(),
            ..OclConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("kernel_arg_info"));
    }

    #[test]
    fn test_validation_rejects_empty_include_path() {
        let cfg = OclConfig {
            include_paths: vec![PathBuf::from("a"), PathBuf::new()],
            ..OclConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_env_overrides() {
        let joined = std::env::join_paths(["inc_a", "inc_b"]).unwrap();
        let joined = joined.to_str().unwrap().to_string();
        temp_env::with_vars(
            [
                ("OCLKIT_PLATFORM", Some("Portable Computing Language")),
                ("OCLKIT_DEVICE_TYPE", Some("ACCELERATOR")),
                ("OCLKIT_BUILD_OPTIONS", Some("-Werror")),
                ("OCLKIT_INCLUDE_PATH", Some(joined.as_str())),
                ("OCLKIT_KERNEL_ARG_INFO", Some("off")),
                ("OCLKIT_QUEUE_PROFILING", Some("1")),
            ],
            || {
                let cfg = OclConfig::from_env().unwrap();
                assert_eq!(cfg.platform_name, "Portable Computing Language");
                assert_eq!(cfg.device_type, DeviceKind::Accelerator);
                assert_eq!(cfg.build_options, "-Werror");
                assert_eq!(
                    cfg.include_paths,
                    vec![PathBuf::from("inc_a"), PathBuf::from("inc_b")]
                );
                assert!(!cfg.kernel_arg_info);
                assert!(cfg.queue_profiling);
            },
        );
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_env_override_invalid_device_type() {
        temp_env::with_vars([("OCLKIT_DEVICE_TYPE", Some("quantum"))], || {
            let err = OclConfig::from_env().unwrap_err();
            match err {
                ConfigError::EnvOverride { key, value, .. } => {
                    assert_eq!(key, "OCLKIT_DEVICE_TYPE");
                    assert_eq!(value, "quantum");
                }
                other => panic!("unexpected error: {other}"),
            }
        });
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_env_override_invalid_flag() {
        temp_env::with_vars([("OCLKIT_QUEUE_PROFILING", Some("maybe"))], || {
            let err = OclConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("OCLKIT_QUEUE_PROFILING=maybe"));
        });
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_load_from_file() {
        temp_env::with_vars(ALL_VARS, || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("oclkit.toml");
            std::fs::write(&path, "platform_name = \"NVIDIA CUDA\"\nqueue_profiling = true\n")
                .unwrap();
            let cfg = OclConfig::load(&path).unwrap();
            assert_eq!(cfg.platform_name, "NVIDIA CUDA");
            assert!(cfg.queue_profiling);
        });
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = OclConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_device_kind_masks() {
        assert_eq!(DeviceKind::Gpu.device_type(), DeviceType::GPU);
        assert_eq!(DeviceKind::All.device_type(), DeviceType::ALL);
        assert_eq!("Cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!(DeviceKind::Accelerator.to_string(), "accelerator");
    }
}
