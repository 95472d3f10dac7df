//! Appliance and build configuration.
//!
//! `ApplianceConfig` is produced by the kickstart parser and describes what
//! to build; `BuildConfig` describes where and with which resources to build
//! it, and can be loaded from a project TOML file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Filesystem type used for partitions that don't specify one.
pub const DEFAULT_FILESYSTEM_TYPE: &str = "ext4";

/// Operating system identity of an appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsIdentity {
    pub name: String,
    pub version: String,
}

/// A single partition of the appliance disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Partition size in megabytes. Always positive.
    pub size: f64,
    /// Filesystem type; [`DEFAULT_FILESYSTEM_TYPE`] when not given.
    pub fstype: Option<String>,
    /// Mount options, in the order they were declared.
    pub options: Vec<String>,
}

impl Partition {
    /// Filesystem type to format this partition with.
    pub fn effective_fstype(&self) -> &str {
        self.fstype.as_deref().unwrap_or(DEFAULT_FILESYSTEM_TYPE)
    }
}

/// A package repository declared by the appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub name: String,
    pub baseurl: String,
    pub mirrorlist: Option<String>,
    /// Ephemeral repos are used during the build only and are never
    /// persisted into the image's repository list.
    pub ephemeral: bool,
}

/// Everything the builder needs to know about one appliance.
///
/// Produced once per kickstart parse and immutable afterwards; downstream
/// stages borrow it.
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    /// Appliance name, derived from the definition file stem.
    pub name: String,
    pub os: OsIdentity,
    /// Partition table keyed by mount path. Duplicate mount paths in the
    /// definition are resolved last-write-wins.
    pub partitions: BTreeMap<String, Partition>,
    pub repos: Vec<Repo>,
    pub packages: Vec<String>,
    /// Crypted root password hash, if the definition sets one.
    pub root_password: Option<String>,
}

/// Build-side settings: directories, output name and virtual hardware.
///
/// Read-only to the core components; constructed from project configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root directory for build artifacts.
    pub build_root: PathBuf,
    /// Working directory handed to the creator tool.
    pub tmp_dir: PathBuf,
    /// Package cache root, scoped per arch/OS/version by the builder.
    pub cache_dir: PathBuf,
    /// Name used for the produced disk image.
    pub image_name: String,
    /// Host architecture, scopes the package cache path.
    pub arch: String,
    pub vcpu: u32,
    pub vmem_mb: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectToml {
    build: ProjectBuildToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectBuildToml {
    build_root: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    vcpu: Option<u32>,
    vmem_mb: Option<u32>,
}

impl BuildConfig {
    /// Default settings for an appliance, rooted under `build/`.
    pub fn for_appliance(image_name: &str) -> Self {
        let build_root = PathBuf::from("build");
        Self {
            tmp_dir: build_root.join("tmp"),
            cache_dir: build_root.join("cache"),
            build_root,
            image_name: image_name.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            vcpu: 1,
            vmem_mb: 512,
        }
    }

    /// Load project settings from a TOML file, filling gaps with defaults.
    pub fn from_project_file(path: &Path, image_name: &str) -> Result<Self> {
        let bytes = fs::read_to_string(path)
            .with_context(|| format!("reading project config '{}'", path.display()))?;
        let parsed: ProjectToml = toml::from_str(&bytes)
            .with_context(|| format!("parsing project config '{}'", path.display()))?;

        let mut config = Self::for_appliance(image_name);
        if let Some(build_root) = parsed.build.build_root {
            config.tmp_dir = build_root.join("tmp");
            config.cache_dir = build_root.join("cache");
            config.build_root = build_root;
        }
        if let Some(cache_dir) = parsed.build.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(vcpu) = parsed.build.vcpu {
            if vcpu == 0 {
                bail!("invalid project config '{}': vcpu must be > 0", path.display());
            }
            config.vcpu = vcpu;
        }
        if let Some(vmem_mb) = parsed.build.vmem_mb {
            if vmem_mb == 0 {
                bail!(
                    "invalid project config '{}': vmem_mb must be > 0",
                    path.display()
                );
            }
            config.vmem_mb = vmem_mb;
        }
        Ok(config)
    }
}
