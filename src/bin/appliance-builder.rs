use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use appliance_builder::config::BuildConfig;
use appliance_builder::{builder, kickstart};

const PROJECT_CONFIG: &str = "project.toml";

fn usage() -> &'static str {
    "Usage:\n  appliance-builder build <definition.ks> [project.toml]\n  appliance-builder validate <definition.ks>"
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let result = match args.as_slice() {
        [cmd, definition] if cmd == "build" => build(Path::new(definition), None),
        [cmd, definition, project] if cmd == "build" => {
            build(Path::new(definition), Some(Path::new(project)))
        }
        [cmd, definition] if cmd == "validate" => validate(Path::new(definition)),
        _ => Err(anyhow::anyhow!(usage())),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn build(definition: &Path, project: Option<&Path>) -> Result<()> {
    let appliance = kickstart::parse_kickstart(definition)?;
    let config = load_build_config(project, &appliance.name)?;
    builder::build(&appliance, &config)?;
    Ok(())
}

fn validate(definition: &Path) -> Result<()> {
    let appliance = kickstart::parse_kickstart(definition)?;
    println!(
        "{}: {} {}, {} partition(s), {} repo(s)",
        appliance.name,
        appliance.os.name,
        appliance.os.version,
        appliance.partitions.len(),
        appliance.repos.len()
    );
    for (mount, part) in &appliance.partitions {
        println!("  {} {} MB ({})", mount, part.size, part.effective_fstype());
    }
    Ok(())
}

fn load_build_config(project: Option<&Path>, appliance_name: &str) -> Result<BuildConfig> {
    match project {
        Some(path) => {
            if !path.is_file() {
                bail!("project config '{}' not found", path.display());
            }
            BuildConfig::from_project_file(path, appliance_name)
        }
        None => {
            let default = Path::new(PROJECT_CONFIG);
            if default.is_file() {
                BuildConfig::from_project_file(default, appliance_name)
                    .with_context(|| format!("loading '{PROJECT_CONFIG}'"))
            } else {
                Ok(BuildConfig::for_appliance(appliance_name))
            }
        }
    }
}
