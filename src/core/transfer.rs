//! Clone-command construction.
//!
//! Copies are delegated to rsync: whole files, compared by checksum, with
//! ownership and permissions dropped since every target is a fresh
//! filesystem.

use std::path::Path;

use super::executor::PrivilegedCommand;

/// `rsync` invocation copying `source` (file or directory) into `destination`.
///
/// Without a trailing slash on the source, a directory lands as
/// `destination/<name>` just like `cp -r`.
pub fn clone_command(source: &Path, destination: &Path, exclude: &[String]) -> PrivilegedCommand {
    let mut destination = destination.to_string_lossy().into_owned();
    if !destination.ends_with('/') {
        destination.push('/');
    }

    PrivilegedCommand::new("rsync")
        .args([
            "--recursive",
            "--checksum",
            "--whole-file",
            "--no-perms",
            "--no-owner",
            "--no-group",
        ])
        .args(exclude.iter().map(|ext| format!("--exclude=*{ext}")))
        .arg(source.to_string_lossy())
        .arg(destination)
}
