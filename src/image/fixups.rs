//! OS-version-conditional image fixups.
//!
//! Instead of branching on OS versions inline, a capability table maps an
//! OS identity to the fixup steps it needs; the builder looks the set up
//! once and applies it after the common customization passes.

use std::path::Path;

use anyhow::{bail, Result};

use super::GuestImage;
use crate::config::OsIdentity;
use crate::process;

/// A single post-build fixup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// Append `biosdevname=0` to the kernel lines so interface names stay
    /// stable across the device-naming scheme change.
    DisableBiosdevname,
    /// Boot into multi-user.target instead of the graphical default.
    DefaultRunlevelMultiUser,
    DisableNetfs,
    /// The creator host's rpm may write a database the guest's older rpm
    /// cannot read; dump and reload it with the guest's own tools.
    RebuildRpmDatabase,
}

/// Capability table mapping OS identities to their fixup sets.
const OS_FIXUPS: &[(&str, &str, &[Fixup])] = &[(
    "fedora",
    "15",
    &[
        Fixup::DisableBiosdevname,
        Fixup::DefaultRunlevelMultiUser,
        Fixup::DisableNetfs,
        Fixup::RebuildRpmDatabase,
    ],
)];

/// Fixups required for the given OS; empty for anything not in the table.
pub fn fixups_for(os: &OsIdentity) -> &'static [Fixup] {
    OS_FIXUPS
        .iter()
        .find(|(name, version, _)| *name == os.name && *version == os.version)
        .map(|(_, _, fixups)| *fixups)
        .unwrap_or(&[])
}

pub fn apply(guest: &mut dyn GuestImage, fixup: Fixup, tmp_dir: &Path) -> Result<()> {
    match fixup {
        Fixup::DisableBiosdevname => disable_biosdevname(guest),
        Fixup::DefaultRunlevelMultiUser => change_default_runlevel(guest),
        Fixup::DisableNetfs => disable_netfs(guest),
        Fixup::RebuildRpmDatabase => rebuild_rpm_database(guest, tmp_dir),
    }
}

pub fn disable_biosdevname(guest: &mut dyn GuestImage) -> Result<()> {
    guest.sh("sed -i \"s/kernel\\(.*\\)/kernel\\1 biosdevname=0/g\" /boot/grub/grub.conf")?;
    Ok(())
}

pub fn change_default_runlevel(guest: &mut dyn GuestImage) -> Result<()> {
    guest.sh(
        "rm -f /etc/systemd/system/default.target && \
         ln -sf /lib/systemd/system/multi-user.target /etc/systemd/system/default.target",
    )?;
    Ok(())
}

pub fn disable_netfs(guest: &mut dyn GuestImage) -> Result<()> {
    guest.sh("chkconfig netfs off")?;
    Ok(())
}

/// Dump the installed-package database with the host's rpmdb tools and
/// reload it inside the guest, then force a full rebuild.
pub fn rebuild_rpm_database(guest: &mut dyn GuestImage, tmp_dir: &Path) -> Result<()> {
    println!("Rebuilding RPM database...");

    let packages = tmp_dir.join("Packages");
    let dump = tmp_dir.join("Packages.dump");

    guest.download("/var/lib/rpm/Packages", &packages)?;
    let command = rpmdb_dump_command(&packages, &dump);
    if !process::execute(&command, None, false)? {
        bail!("rpmdb_dump failed for '{}'", packages.display());
    }
    guest.upload(&dump, "/tmp/Packages.dump")?;
    guest.sh("rm -rf /var/lib/rpm/*")?;
    guest.sh("cd /var/lib/rpm/ && cat /tmp/Packages.dump | /usr/lib/rpm/rpmdb_load Packages")?;
    guest.sh("rpm --rebuilddb")?;
    Ok(())
}

fn rpmdb_dump_command(packages: &Path, dump: &Path) -> String {
    format!(
        "/usr/lib/rpm/rpmdb_dump {} > {}",
        packages.display(),
        dump.display()
    )
}
