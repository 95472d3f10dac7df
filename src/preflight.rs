//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a build (and a potential teardown)
//! will shell out to, before any work starts. This prevents cryptic errors
//! halfway through an image build.

use anyhow::{bail, Result};

/// Host tools an appliance build requires.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("appliance-creator", "appliance-tools"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("losetup", "util-linux"),
    ("kpartx", "kpartx"),
];

/// Check if a command can be resolved on the host PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available, reporting all missing ones at
/// once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
