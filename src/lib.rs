//! Builds bootable VM appliance images from annotated kickstart definitions.
//!
//! An appliance definition is an ordinary kickstart file carrying two
//! directive comments for the OS identity (`# bg_os_name:` /
//! `# bg_os_version:`). This crate parses the definition, drives the
//! external `appliance-creator` tool to produce a raw disk image, and
//! customizes the result (repository files, label-based partition
//! references, service toggles, OS-version fixups).
//!
//! # Architecture
//!
//! ```text
//! kickstart::parse_kickstart ──► builder::build ──► raw image
//!                                      │                │
//!                          (interrupted creator run)    ▼
//!                                      ▼          image::customize
//!                         teardown::cleanup_after_creator
//! ```
//!
//! [`image::customize`] operates on the produced image through the
//! [`GuestImage`] trait; the embedding application supplies the adapter that
//! actually opens the disk image.
//!
//! The builder is the only component that spawns long-running work;
//! [`process::execute`] drains the creator's stdout and stderr concurrently
//! and detects interruption, and [`teardown`] unwinds the mounts,
//! device-mapper partition nodes and loop devices the tool leaves behind
//! when killed. One build runs at a time per build root; nothing here locks
//! the host-level resources, strict sequencing is the documented constraint.

pub mod builder;
pub mod config;
pub mod image;
pub mod kickstart;
pub mod preflight;
pub mod process;
pub mod teardown;

pub use config::{ApplianceConfig, BuildConfig, OsIdentity, Partition, Repo};
pub use image::GuestImage;
pub use kickstart::{parse_kickstart, ParseError};
pub use process::{execute, Cmd, ExecError};
