//! Post-build customization of the produced disk image.
//!
//! The image is manipulated through the narrow [`GuestImage`] capability
//! set, implemented by a real libguestfs-backed adapter outside this crate
//! and by a fake in tests. Customization is a fixed sequence of passes; the
//! OS-version-conditional ones live in [`fixups`].

pub mod fixups;

use std::path::Path;

use anyhow::Result;

use crate::config::{ApplianceConfig, Repo};

/// Directory the repository definition files are written to.
pub const REPO_DIR: &str = "/etc/yum.repos.d";

/// Files that may reference partitions by device path.
const DEVICE_REFERENCE_FILES: &[&str] = &["/etc/fstab", "/boot/grub/grub.conf"];

/// Handle to a mounted appliance image.
///
/// Paths on the guest side are absolute strings inside the image; `local`
/// paths live on the build host.
pub trait GuestImage {
    fn write_file(&mut self, path: &str, content: &str, mode: i32) -> Result<()>;
    fn read_file(&mut self, path: &str) -> Result<String>;
    fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;
    fn download(&mut self, remote: &str, local: &Path) -> Result<()>;
    fn sh(&mut self, command: &str) -> Result<String>;
    fn list_devices(&mut self) -> Result<Vec<String>>;
    /// Filesystem label of a device; empty string when none is set.
    fn vfs_label(&mut self, device: &str) -> Result<String>;
    fn exists(&mut self, path: &str) -> Result<bool>;
}

/// Run the full customization pass over a freshly built image.
pub fn customize(
    guest: &mut dyn GuestImage,
    appliance: &ApplianceConfig,
    tmp_dir: &Path,
) -> Result<()> {
    println!("Customizing appliance image...");

    guest.upload(Path::new("/etc/resolv.conf"), "/etc/resolv.conf")?;
    change_configuration(guest, appliance)?;
    apply_root_password(guest, appliance)?;
    use_labels_for_partitions(guest)?;
    disable_firewall(guest)?;
    set_motd(guest, appliance)?;
    install_repos(guest, &appliance.repos)?;

    for fixup in fixups::fixups_for(&appliance.os) {
        fixups::apply(guest, *fixup, tmp_dir)?;
    }

    disable_firstboot(guest)?;
    Ok(())
}

/// Basic network and hostname setup.
fn change_configuration(guest: &mut dyn GuestImage, appliance: &ApplianceConfig) -> Result<()> {
    let content = format!("NETWORKING=yes\nHOSTNAME={}\n", appliance.name);
    guest.write_file("/etc/sysconfig/network", &content, 0)
}

fn apply_root_password(guest: &mut dyn GuestImage, appliance: &ApplianceConfig) -> Result<()> {
    if let Some(hash) = &appliance.root_password {
        guest.sh(&format!("usermod --password '{hash}' root"))?;
    }
    Ok(())
}

pub fn disable_firewall(guest: &mut dyn GuestImage) -> Result<()> {
    guest.sh("lokkit -q --disabled")?;
    Ok(())
}

fn set_motd(guest: &mut dyn GuestImage, appliance: &ApplianceConfig) -> Result<()> {
    let motd = format!(
        "Welcome to the {} appliance ({} {})\n",
        appliance.name, appliance.os.name, appliance.os.version
    );
    guest.write_file("/etc/motd", &motd, 0)
}

fn disable_firstboot(guest: &mut dyn GuestImage) -> Result<()> {
    if guest.exists("/etc/init.d/firstboot")? {
        guest.sh("chkconfig firstboot off")?;
    }
    Ok(())
}

/// Write repository definition files for every non-ephemeral repo.
pub fn install_repos(guest: &mut dyn GuestImage, repos: &[Repo]) -> Result<()> {
    for repo in repos.iter().filter(|repo| !repo.ephemeral) {
        let path = format!("{REPO_DIR}/{}.repo", repo.name);
        guest.write_file(&path, &repo_definition(repo), 0)?;
    }
    Ok(())
}

/// One repo stanza. Field order is fixed: name, enabled, gpgcheck, baseurl,
/// then mirrorlist when present.
pub fn repo_definition(repo: &Repo) -> String {
    let mut out = format!(
        "[{name}]\nname={name}\nenabled=1\ngpgcheck=0\nbaseurl={baseurl}\n",
        name = repo.name,
        baseurl = repo.baseurl
    );
    if let Some(mirrorlist) = &repo.mirrorlist {
        out.push_str(&format!("mirrorlist={mirrorlist}\n"));
    }
    out
}

/// Rewrite device-path partition references in fstab and the bootloader
/// config to `LABEL=` form.
///
/// Partition numbers are resolved against the image's first block device;
/// references whose partition has no label are left alone, and files without
/// any device-path reference are not rewritten at all. Running this twice
/// changes nothing.
pub fn use_labels_for_partitions(guest: &mut dyn GuestImage) -> Result<()> {
    let devices = guest.list_devices()?;
    let Some(base) = devices.first().cloned() else {
        return Ok(());
    };

    for file in DEVICE_REFERENCE_FILES {
        let content = guest.read_file(file)?;
        let mut lookup = |partition: u32| -> Result<Option<String>> {
            let label = guest.vfs_label(&format!("{base}{partition}"))?;
            Ok((!label.is_empty()).then_some(label))
        };
        let rewritten = relabel_device_paths(&content, &mut lookup)?;
        if rewritten != content {
            guest.write_file(file, &rewritten, 0)?;
        }
    }
    Ok(())
}

/// Replace `/dev/<letters><N>` tokens with `LABEL=<label>` where `lookup`
/// resolves partition `N` to a label. Tokens without a partition number
/// (`/dev/shm`, `/dev/mapper/...`) are untouched.
fn relabel_device_paths(
    content: &str,
    lookup: &mut dyn FnMut(u32) -> Result<Option<String>>,
) -> Result<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(pos) = rest.find("/dev/") {
        let (before, at) = rest.split_at(pos);
        out.push_str(before);

        let name = &at[5..];
        let letters = name.chars().take_while(char::is_ascii_lowercase).count();
        let digits = name[letters..]
            .chars()
            .take_while(char::is_ascii_digit)
            .count();
        if letters == 0 || digits == 0 {
            out.push_str("/dev/");
            rest = name;
            continue;
        }

        let token_len = 5 + letters + digits;
        let token = &at[..token_len];
        let partition = name[letters..letters + digits].parse::<u32>().ok();
        let label = match partition {
            Some(partition) => lookup(partition)?,
            None => None,
        };
        match label {
            Some(label) => {
                out.push_str("LABEL=");
                out.push_str(&label);
            }
            None => out.push_str(token),
        }
        rest = &at[token_len..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplianceConfig, OsIdentity};
    use anyhow::bail;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Default)]
    struct FakeGuest {
        files: HashMap<String, String>,
        devices: Vec<String>,
        labels: HashMap<String, String>,
        sh_commands: Vec<String>,
        written: Vec<String>,
        uploads: Vec<String>,
    }

    impl GuestImage for FakeGuest {
        fn write_file(&mut self, path: &str, content: &str, _mode: i32) -> Result<()> {
            self.files.insert(path.to_string(), content.to_string());
            self.written.push(path.to_string());
            Ok(())
        }

        fn read_file(&mut self, path: &str) -> Result<String> {
            match self.files.get(path) {
                Some(content) => Ok(content.clone()),
                None => bail!("no such file in image: {path}"),
            }
        }

        fn upload(&mut self, _local: &Path, remote: &str) -> Result<()> {
            self.uploads.push(remote.to_string());
            Ok(())
        }

        fn download(&mut self, remote: &str, local: &Path) -> Result<()> {
            let content = self.read_file(remote)?;
            std::fs::write(local, content)?;
            Ok(())
        }

        fn sh(&mut self, command: &str) -> Result<String> {
            self.sh_commands.push(command.to_string());
            Ok(String::new())
        }

        fn list_devices(&mut self) -> Result<Vec<String>> {
            Ok(self.devices.clone())
        }

        fn vfs_label(&mut self, device: &str) -> Result<String> {
            Ok(self.labels.get(device).cloned().unwrap_or_default())
        }

        fn exists(&mut self, path: &str) -> Result<bool> {
            Ok(self.files.contains_key(path))
        }
    }

    fn repo(name: &str, baseurl: &str, mirrorlist: Option<&str>, ephemeral: bool) -> Repo {
        Repo {
            name: name.to_string(),
            baseurl: baseurl.to_string(),
            mirrorlist: mirrorlist.map(str::to_string),
            ephemeral,
        }
    }

    #[test]
    fn test_install_repos_fixed_field_order() {
        let mut guest = FakeGuest::default();
        let repos = vec![
            repo(
                "cirras",
                "http://repo.example.org/packages/fedora/11/RPMS/x86_64",
                None,
                false,
            ),
            repo(
                "abc",
                "http://abc",
                Some("http://abc.org/packages/fedora/11/RPMS/x86_64"),
                false,
            ),
        ];

        install_repos(&mut guest, &repos).unwrap();

        assert_eq!(
            guest.files["/etc/yum.repos.d/cirras.repo"],
            "[cirras]\nname=cirras\nenabled=1\ngpgcheck=0\n\
             baseurl=http://repo.example.org/packages/fedora/11/RPMS/x86_64\n"
        );
        assert_eq!(
            guest.files["/etc/yum.repos.d/abc.repo"],
            "[abc]\nname=abc\nenabled=1\ngpgcheck=0\nbaseurl=http://abc\n\
             mirrorlist=http://abc.org/packages/fedora/11/RPMS/x86_64\n"
        );
    }

    #[test]
    fn test_install_repos_skips_ephemeral() {
        let mut guest = FakeGuest::default();
        let repos = vec![
            repo("abc", "http://abc", None, false),
            repo("build-only", "http://ephemeral", None, true),
        ];

        install_repos(&mut guest, &repos).unwrap();

        assert!(guest.files.contains_key("/etc/yum.repos.d/abc.repo"));
        assert!(!guest.files.contains_key("/etc/yum.repos.d/build-only.repo"));
    }

    const GRUB_WITH_DEVICE: &str = "default=0\ntimeout=5\ntitle f14-core\nroot (hd0,0)\n\
                                    kernel /boot/vmlinuz ro root=/dev/sda1\ninitrd /boot/initramfs.img\n";
    const GRUB_WITH_LABEL: &str = "default=0\ntimeout=5\ntitle f14-core\nroot (hd0,0)\n\
                                   kernel /boot/vmlinuz ro root=LABEL=/\ninitrd /boot/initramfs.img\n";

    fn guest_with_device_paths() -> FakeGuest {
        let mut guest = FakeGuest::default();
        guest.devices = vec!["/dev/hda".to_string()];
        guest.labels.insert("/dev/hda1".to_string(), "/".to_string());
        guest.files.insert(
            "/etc/fstab".to_string(),
            "/dev/sda1 / something\nLABEL=/boot /boot something\n".to_string(),
        );
        guest
            .files
            .insert("/boot/grub/grub.conf".to_string(), GRUB_WITH_DEVICE.to_string());
        guest
    }

    #[test]
    fn test_use_labels_rewrites_device_references() {
        let mut guest = guest_with_device_paths();
        use_labels_for_partitions(&mut guest).unwrap();

        assert_eq!(
            guest.files["/etc/fstab"],
            "LABEL=/ / something\nLABEL=/boot /boot something\n"
        );
        assert_eq!(guest.files["/boot/grub/grub.conf"], GRUB_WITH_LABEL);
    }

    #[test]
    fn test_use_labels_is_a_noop_on_label_based_files() {
        let mut guest = FakeGuest::default();
        guest.devices = vec!["/dev/sda".to_string()];
        guest.files.insert(
            "/etc/fstab".to_string(),
            "LABEL=/ / something\nLABEL=/boot /boot something\n".to_string(),
        );
        guest
            .files
            .insert("/boot/grub/grub.conf".to_string(), GRUB_WITH_LABEL.to_string());

        use_labels_for_partitions(&mut guest).unwrap();

        assert!(guest.written.is_empty());
    }

    #[test]
    fn test_use_labels_is_idempotent() {
        let mut guest = guest_with_device_paths();
        use_labels_for_partitions(&mut guest).unwrap();
        let writes_after_first = guest.written.len();

        use_labels_for_partitions(&mut guest).unwrap();
        assert_eq!(guest.written.len(), writes_after_first);
    }

    #[test]
    fn test_unlabeled_partitions_keep_device_paths() {
        let mut lookup = |_: u32| Ok(None);
        let content = "/dev/sda2 /data ext4 defaults 0 0\n";
        assert_eq!(relabel_device_paths(content, &mut lookup).unwrap(), content);
    }

    #[test]
    fn test_relabel_leaves_non_partition_devices_alone() {
        let mut lookup = |_: u32| Ok(Some("/".to_string()));
        let content = "tmpfs /dev/shm tmpfs defaults 0 0\n/dev/mapper/vg0-root / ext4\n";
        assert_eq!(relabel_device_paths(content, &mut lookup).unwrap(), content);
    }

    fn appliance(os_name: &str, os_version: &str) -> ApplianceConfig {
        ApplianceConfig {
            name: "full".to_string(),
            os: OsIdentity {
                name: os_name.to_string(),
                version: os_version.to_string(),
            },
            partitions: BTreeMap::new(),
            repos: vec![repo("abc", "http://abc", None, false)],
            packages: vec![],
            root_password: Some("$1$secret".to_string()),
        }
    }

    #[test]
    fn test_customize_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut guest = guest_with_device_paths();
        guest
            .files
            .insert("/etc/init.d/firstboot".to_string(), String::new());

        customize(&mut guest, &appliance("fedora", "14"), tmp.path()).unwrap();

        assert_eq!(guest.uploads, vec!["/etc/resolv.conf"]);
        assert_eq!(
            guest.files["/etc/sysconfig/network"],
            "NETWORKING=yes\nHOSTNAME=full\n"
        );
        assert!(guest.files.contains_key("/etc/motd"));
        assert!(guest.files.contains_key("/etc/yum.repos.d/abc.repo"));
        assert!(guest
            .sh_commands
            .contains(&"usermod --password '$1$secret' root".to_string()));
        assert!(guest.sh_commands.contains(&"lokkit -q --disabled".to_string()));
        assert!(guest
            .sh_commands
            .contains(&"chkconfig firstboot off".to_string()));
    }

    #[test]
    fn test_customize_skips_firstboot_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut guest = guest_with_device_paths();

        customize(&mut guest, &appliance("fedora", "14"), tmp.path()).unwrap();

        assert!(!guest
            .sh_commands
            .contains(&"chkconfig firstboot off".to_string()));
    }
}
