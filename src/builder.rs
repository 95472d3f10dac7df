//! Appliance build orchestration.
//!
//! A build renders the kickstart file, hands it to the external
//! `appliance-creator` tool, and sorts the outcome into one of three paths:
//! success (move the raw image to the build root), ordinary failure
//! (propagate; the tool cleans up after itself), or interruption (tear down
//! the tool's mounts and loop devices, then fail the build).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::{ApplianceConfig, BuildConfig};
use crate::kickstart;
use crate::preflight;
use crate::process::{self, ExecError};
use crate::teardown;

/// Command line for the external creator tool. The flag set is fixed; only
/// the paths, name and virtual hardware vary.
pub fn creator_command(
    kickstart_path: &Path,
    appliance: &ApplianceConfig,
    config: &BuildConfig,
) -> String {
    format!(
        "appliance-creator -d -v -t '{tmp}' --cache={cache}/rpms-cache/{arch}/{os}/{version} \
         --config '{ks}' -o '{tmp}' --name '{name}' --vmem {vmem} --vcpu {vcpu} --format raw",
        tmp = config.tmp_dir.display(),
        cache = config.cache_dir.display(),
        arch = config.arch,
        os = appliance.os.name,
        version = appliance.os.version,
        ks = kickstart_path.display(),
        name = config.image_name,
        vmem = config.vmem_mb,
        vcpu = config.vcpu,
    )
}

/// Build the appliance image. Returns the path to the produced raw image
/// under the build root.
///
/// An interrupted creator run triggers [`teardown::cleanup_after_creator`]
/// and then fails the build; the caller is expected to exit non-zero.
pub fn build(appliance: &ApplianceConfig, config: &BuildConfig) -> Result<PathBuf> {
    println!(
        "=== Building appliance '{}' ({} {}) ===\n",
        config.image_name, appliance.os.name, appliance.os.version
    );

    preflight::check_host_tools()?;

    fs::create_dir_all(&config.tmp_dir).with_context(|| {
        format!(
            "creating build working directory '{}'",
            config.tmp_dir.display()
        )
    })?;
    let kickstart_path = config.tmp_dir.join(format!("{}.ks", config.image_name));
    fs::write(&kickstart_path, kickstart::render_kickstart(appliance))
        .with_context(|| format!("writing kickstart '{}'", kickstart_path.display()))?;

    let log_path = config
        .tmp_dir
        .join(format!("{}-creator.log", config.image_name));
    let command = creator_command(&kickstart_path, appliance, config);

    println!("Running appliance creator...");
    match process::execute(&command, Some(&log_path), true) {
        Ok(true) => {}
        Ok(false) => bail!(
            "appliance-creator failed for '{}'; see '{}'",
            config.image_name,
            log_path.display()
        ),
        Err(ExecError::Interrupted { pid, .. }) => {
            println!("Build interrupted; unwinding creator mounts and loop devices.");
            teardown::cleanup_after_creator(&config.tmp_dir, pid);
            bail!(
                "appliance build for '{}' was interrupted",
                config.image_name
            );
        }
        Err(e @ ExecError::Launch { .. }) => {
            return Err(e).context("launching appliance-creator");
        }
    }

    // The creator tool nests its output in a directory named after the
    // appliance.
    let raw_name = format!("{}-sda.raw", config.image_name);
    let produced = config.tmp_dir.join(&config.image_name).join(&raw_name);
    let artifact = config.build_root.join(&raw_name);
    move_image(&produced, &artifact)?;

    fs::remove_dir_all(&config.tmp_dir).with_context(|| {
        format!(
            "removing build working directory '{}'",
            config.tmp_dir.display()
        )
    })?;

    println!("\n=== Appliance image built ===");
    println!("  Output: {}", artifact.display());
    Ok(artifact)
}

/// Move the produced image into place, falling back to copy-and-remove when
/// the rename crosses filesystems.
fn move_image(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }
    if to.exists() {
        fs::remove_file(to)
            .with_context(|| format!("removing stale image '{}'", to.display()))?;
    }
    fs::rename(from, to)
        .or_else(|_| {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok::<(), std::io::Error>(())
        })
        .with_context(|| {
            format!(
                "moving appliance image '{}' -> '{}'",
                from.display(),
                to.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsIdentity;
    use std::collections::BTreeMap;

    fn appliance(os_name: &str, os_version: &str) -> ApplianceConfig {
        ApplianceConfig {
            name: "full".to_string(),
            os: OsIdentity {
                name: os_name.to_string(),
                version: os_version.to_string(),
            },
            partitions: BTreeMap::new(),
            repos: vec![],
            packages: vec![],
            root_password: None,
        }
    }

    #[test]
    fn test_creator_command_line() {
        let config = BuildConfig {
            build_root: PathBuf::from("build/path"),
            tmp_dir: PathBuf::from("build/path/tmp"),
            cache_dir: PathBuf::from("cachedir"),
            image_name: "full".to_string(),
            arch: "x86_64".to_string(),
            vcpu: 1,
            vmem_mb: 512,
        };
        let command = creator_command(Path::new("kickstart.ks"), &appliance("fedora", "14"), &config);
        assert_eq!(
            command,
            "appliance-creator -d -v -t 'build/path/tmp' \
             --cache=cachedir/rpms-cache/x86_64/fedora/14 --config 'kickstart.ks' \
             -o 'build/path/tmp' --name 'full' --vmem 512 --vcpu 1 --format raw"
        );
    }

    #[test]
    fn test_move_image_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("work/full-sda.raw");
        let to = dir.path().join("out/full-sda.raw");
        fs::create_dir_all(from.parent().unwrap()).unwrap();
        fs::write(&from, b"new image").unwrap();
        fs::create_dir_all(to.parent().unwrap()).unwrap();
        fs::write(&to, b"old image").unwrap();

        move_image(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"new image");
    }
}
