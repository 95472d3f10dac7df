//! Kickstart definition parsing and rendering.
//!
//! Appliance definitions are ordinary kickstart files annotated with two
//! directive comments carrying the OS identity:
//!
//! ```text
//! # bg_os_name: fedora
//! # bg_os_version: 14
//! part / --size=2048 --fstype=ext4
//! ```
//!
//! The parser extracts the OS identity, the partition table and (when
//! present) repo, rootpw and %packages data; everything else in the file is
//! left to the creator tool. Validation order is fixed: OS name, then OS
//! version, then per-partition size, then at least one partition.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use thiserror::Error;

use crate::config::{ApplianceConfig, OsIdentity, Partition, Repo};

const OS_NAME_DIRECTIVE: &str = "bg_os_name:";
const OS_VERSION_DIRECTIVE: &str = "bg_os_version:";

/// Validation failures for an appliance definition. Messages carry the
/// offending mount path and source file verbatim; they are user-facing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no operating system name specified in {file}; add a comment like '# bg_os_name: fedora'")]
    MissingOsName { file: String },
    #[error("no operating system version specified in {file}; add a comment like '# bg_os_version: 14'")]
    MissingOsVersion { file: String },
    #[error("partition size not specified for {mount} partition in {file}")]
    MissingPartitionSize { mount: String, file: String },
    #[error("no partitions specified in your kickstart file {file}")]
    NoPartitions { file: String },
}

/// Read and validate an appliance definition from disk.
///
/// The appliance name derives from the definition file stem.
pub fn parse_kickstart(path: &Path) -> anyhow::Result<ApplianceConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading appliance definition '{}'", path.display()))?;
    let file = path.display().to_string();
    let name = path
        .file_stem()
        .and_then(|part| part.to_str())
        .unwrap_or("appliance")
        .to_string();
    Ok(parse_kickstart_str(&text, &file, &name)?)
}

/// Parse an appliance definition from text. `file` is only used in error
/// messages and must match what the author sees.
pub fn parse_kickstart_str(
    text: &str,
    file: &str,
    name: &str,
) -> Result<ApplianceConfig, ParseError> {
    let os = parse_os_identity(text, file)?;

    let mut partitions = BTreeMap::new();
    let mut repos = Vec::new();
    let mut packages = Vec::new();
    let mut root_password = None;

    let mut in_packages = false;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "%end" {
            in_packages = false;
            continue;
        }
        if line.starts_with("%packages") {
            in_packages = true;
            continue;
        }
        if line.starts_with('%') {
            // Some other section (%post, %pre); not ours to interpret.
            in_packages = false;
            continue;
        }
        if in_packages {
            packages.push(line.to_string());
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("part" | "partition") => {
                let Some(mount) = tokens.get(1).copied() else {
                    continue;
                };
                let fields = &tokens[2..];
                let size = option_value(fields, "--size")
                    .and_then(|v| v.parse::<f64>().ok())
                    .filter(|size| *size > 0.0)
                    .ok_or_else(|| ParseError::MissingPartitionSize {
                        mount: mount.to_string(),
                        file: file.to_string(),
                    })?;
                let fstype = option_value(fields, "--fstype");
                let options = option_value(fields, "--fsoptions")
                    .map(|v| v.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
                // Last directive wins for duplicate mount paths.
                partitions.insert(
                    mount.to_string(),
                    Partition {
                        size,
                        fstype,
                        options,
                    },
                );
            }
            Some("repo") => {
                let fields = &tokens[1..];
                let name = option_value(fields, "--name");
                let baseurl = option_value(fields, "--baseurl");
                if let (Some(name), Some(baseurl)) = (name, baseurl) {
                    repos.push(Repo {
                        name,
                        baseurl,
                        mirrorlist: option_value(fields, "--mirrorlist"),
                        ephemeral: has_flag(fields, "--ephemeral"),
                    });
                }
            }
            Some("rootpw") => {
                root_password = tokens[1..]
                    .iter()
                    .rev()
                    .find(|t| !t.starts_with("--"))
                    .map(|t| t.to_string());
            }
            _ => {}
        }
    }

    if partitions.is_empty() {
        return Err(ParseError::NoPartitions {
            file: file.to_string(),
        });
    }

    Ok(ApplianceConfig {
        name: name.to_string(),
        os,
        partitions,
        repos,
        packages,
        root_password,
    })
}

fn parse_os_identity(text: &str, file: &str) -> Result<OsIdentity, ParseError> {
    let mut name = None;
    let mut version = None;

    for line in text.lines() {
        let Some(comment) = line.trim().strip_prefix('#') else {
            continue;
        };
        let comment = comment.trim();
        if let Some(value) = comment.strip_prefix(OS_NAME_DIRECTIVE) {
            let value = value.trim();
            if name.is_none() && !value.is_empty() {
                name = Some(value.to_string());
            }
        } else if let Some(value) = comment.strip_prefix(OS_VERSION_DIRECTIVE) {
            let value = value.trim();
            if version.is_none() && !value.is_empty() {
                version = Some(value.to_string());
            }
        }
    }

    // Name is checked before version, and both before partitions: a file
    // that is missing everything reports the name error.
    let name = name.ok_or_else(|| ParseError::MissingOsName {
        file: file.to_string(),
    })?;
    let version = version.ok_or_else(|| ParseError::MissingOsVersion {
        file: file.to_string(),
    })?;
    Ok(OsIdentity { name, version })
}

/// Look up `--key=value` or `--key value` in a directive's fields.
fn option_value(fields: &[&str], key: &str) -> Option<String> {
    for (i, field) in fields.iter().enumerate() {
        let Some(rest) = field.strip_prefix(key) else {
            continue;
        };
        if let Some(value) = rest.strip_prefix('=') {
            return Some(value.to_string());
        }
        if rest.is_empty() {
            return fields
                .get(i + 1)
                .filter(|next| !next.starts_with("--"))
                .map(|next| next.to_string());
        }
    }
    None
}

fn has_flag(fields: &[&str], key: &str) -> bool {
    fields.iter().any(|field| *field == key)
}

/// Render a concrete kickstart file for the creator tool.
///
/// The output is itself a valid appliance definition (directive comments
/// included), so a rendered file can be re-parsed. Ephemeral repos are
/// rendered without their marker; the creator tool only knows standard
/// kickstart syntax.
pub fn render_kickstart(appliance: &ApplianceConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} appliance definition (generated)\n", appliance.name));
    out.push_str(&format!("# {} {}\n", OS_NAME_DIRECTIVE, appliance.os.name));
    out.push_str(&format!("# {} {}\n", OS_VERSION_DIRECTIVE, appliance.os.version));
    out.push('\n');
    out.push_str("install\ntext\nlang en_US.UTF-8\nkeyboard us\ntimezone --utc UTC\n");
    match &appliance.root_password {
        Some(hash) => out.push_str(&format!("rootpw --iscrypted {hash}\n")),
        None => out.push_str("rootpw --lock\n"),
    }
    out.push_str("firewall --disabled\nzerombr\nclearpart --all\n");

    for (mount, part) in &appliance.partitions {
        out.push_str(&format!(
            "part {} --size={} --fstype={}",
            mount,
            part.size,
            part.effective_fstype()
        ));
        if !part.options.is_empty() {
            out.push_str(&format!(" --fsoptions={}", part.options.join(",")));
        }
        out.push('\n');
    }

    for repo in &appliance.repos {
        out.push_str(&format!("repo --name={} --baseurl={}", repo.name, repo.baseurl));
        if let Some(mirrorlist) = &repo.mirrorlist {
            out.push_str(&format!(" --mirrorlist={mirrorlist}"));
        }
        out.push('\n');
    }

    out.push_str("\n%packages\n");
    if appliance.packages.is_empty() {
        out.push_str("@core\n");
    }
    for package in &appliance.packages {
        out.push_str(package);
        out.push('\n');
    }
    out.push_str("%end\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const JEOS: &str = "\
# bg_os_name: fedora
# bg_os_version: 13

install
part / --size=2048 --fstype=ext4
part /home --size=3072 --fstype=ext3 --fsoptions=abc,def,gef
repo --name=extras --baseurl=http://repo.example.org/packages/fedora/13/RPMS/x86_64
repo --name=build-only --baseurl=http://build.example.org --mirrorlist=http://build.example.org/mirrors --ephemeral

%packages
@core
vim-minimal
%end
";

    #[test]
    fn test_parse_full_definition() {
        let appliance = parse_kickstart_str(JEOS, "jeos-f13.ks", "jeos-f13").unwrap();
        assert_eq!(appliance.name, "jeos-f13");
        assert_eq!(appliance.os.name, "fedora");
        assert_eq!(appliance.os.version, "13");

        assert_eq!(appliance.partitions.len(), 2);
        let root = &appliance.partitions["/"];
        assert_eq!(root.size, 2048.0);
        assert_eq!(root.effective_fstype(), "ext4");
        assert!(root.options.is_empty());

        let home = &appliance.partitions["/home"];
        assert_eq!(home.size, 3072.0);
        assert_eq!(home.effective_fstype(), "ext3");
        assert_eq!(home.options, vec!["abc", "def", "gef"]);

        assert_eq!(appliance.repos.len(), 2);
        assert!(!appliance.repos[0].ephemeral);
        assert!(appliance.repos[1].ephemeral);
        assert_eq!(
            appliance.repos[1].mirrorlist.as_deref(),
            Some("http://build.example.org/mirrors")
        );

        assert_eq!(appliance.packages, vec!["@core", "vim-minimal"]);
    }

    #[test]
    fn test_missing_size_names_mount_and_file() {
        let err = parse_kickstart_str(
            "# bg_os_name: fedora\n# bg_os_version: 14\npart /",
            "jeos-f13.ks",
            "jeos-f13",
        )
        .unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingPartitionSize {
                mount: "/".to_string(),
                file: "jeos-f13.ks".to_string()
            }
        );
        assert_eq!(
            err.to_string(),
            "partition size not specified for / partition in jeos-f13.ks"
        );
    }

    #[test]
    fn test_missing_name_reported_first() {
        // Empty file: both directives missing, name error wins.
        let err = parse_kickstart_str("", "jeos-f13.ks", "jeos-f13").unwrap_err();
        assert!(matches!(err, ParseError::MissingOsName { .. }));
        assert!(err.to_string().contains("jeos-f13.ks"));
    }

    #[test]
    fn test_missing_version() {
        let err = parse_kickstart_str("# bg_os_name: rhel", "jeos-f13.ks", "jeos-f13").unwrap_err();
        assert!(matches!(err, ParseError::MissingOsVersion { .. }));
    }

    #[test]
    fn test_no_partitions() {
        let err = parse_kickstart_str(
            "# bg_os_name: fedora\n# bg_os_version: 14",
            "jeos-f13.ks",
            "jeos-f13",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no partitions specified in your kickstart file jeos-f13.ks"
        );
    }

    #[test]
    fn test_directive_order_is_irrelevant_and_first_wins() {
        let text = "\
part / --size 1024
# bg_os_version: 14
# bg_os_name: fedora
# bg_os_name: centos
";
        let appliance = parse_kickstart_str(text, "a.ks", "a").unwrap();
        assert_eq!(appliance.os.name, "fedora");
        assert_eq!(appliance.partitions["/"].size, 1024.0);
    }

    #[test]
    fn test_duplicate_mount_last_write_wins() {
        let text = "\
# bg_os_name: fedora
# bg_os_version: 14
part / --size=1024 --fstype=ext3
part / --size=4096
";
        let appliance = parse_kickstart_str(text, "a.ks", "a").unwrap();
        assert_eq!(appliance.partitions.len(), 1);
        assert_eq!(appliance.partitions["/"].size, 4096.0);
        assert_eq!(appliance.partitions["/"].effective_fstype(), "ext4");
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let err = parse_kickstart_str(
            "# bg_os_name: fedora\n# bg_os_version: 14\npart / --size=0",
            "a.ks",
            "a",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::MissingPartitionSize { .. }));
    }

    #[test]
    fn test_unrelated_content_ignored() {
        let text = "\
# bg_os_name: fedora
# bg_os_version: 14
lang en_US.UTF-8
services --enabled=network
part / --size=2048
%post
echo hi
%end
";
        let appliance = parse_kickstart_str(text, "a.ks", "a").unwrap();
        assert_eq!(appliance.partitions.len(), 1);
        assert!(appliance.packages.is_empty());
    }

    #[test]
    fn test_render_round_trips() {
        let appliance = parse_kickstart_str(JEOS, "jeos-f13.ks", "jeos-f13").unwrap();
        let rendered = render_kickstart(&appliance);

        assert!(rendered.contains("part / --size=2048 --fstype=ext4\n"));
        assert!(rendered.contains("part /home --size=3072 --fstype=ext3 --fsoptions=abc,def,gef\n"));
        // Ephemeral marker is ours, not the creator tool's.
        assert!(!rendered.contains("--ephemeral"));

        let reparsed = parse_kickstart_str(&rendered, "rendered.ks", "jeos-f13").unwrap();
        assert_eq!(reparsed.os, appliance.os);
        assert_eq!(reparsed.partitions, appliance.partitions);
    }
}
