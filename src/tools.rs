//! Small filesystem utilities shared by the server and console.
//!
//! Adapted from the teacher's `src/tools.rs`: same atomic-write helper,
//! ported from `failure` to `anyhow`. The chunk-store-specific
//! `file_chunker` helper has no SPEC_FULL.md counterpart and was dropped,
//! as was the advisory-lock helper (`lock_file`) — nothing in SPEC_FULL.md
//! locks the work area; the only locking the spec calls for is the update
//! board's own `lock`/`unlock` bracketing, already handled by its backend
//! trait (see `board.rs`).

use anyhow::{bail, Error};
use nix::sys::stat;
use nix::unistd;

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::Path;

pub mod cert;
pub mod http;

/// Write `data` to `path` atomically via a temp file + rename, matching the
/// application server's work-area bookkeeping files.
pub fn file_set_contents<P: AsRef<Path>>(path: P, data: &[u8], perm: Option<stat::Mode>) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };
    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or_else(|| {
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR | stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    });

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_atomically_and_is_readable_afterward() {
        let dir = std::env::temp_dir().join(format!("ddm-core-tools-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bookkeeping.json");

        file_set_contents(&path, b"{\"appid\":1}", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"appid\":1}");

        file_set_contents(&path, b"{\"appid\":2}", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"appid\":2}");

        std::fs::remove_dir_all(&dir).ok();
    }
}
