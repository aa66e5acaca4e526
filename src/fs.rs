/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! A chroot-style filesystem view for resolving dylib paths.
//!
//! Dylib load commands carry absolute paths as they appeared on the original
//! device (`/System/Library/Frameworks/Foo.framework/Foo`). Those paths are
//! rooted under a host directory (the "chroot prefix") rather than read
//! directly off the host's own `/`.

use std::path::{Path, PathBuf};

/// Resolves Mach-O dylib paths against a host directory prefix.
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    pub fn new(root: PathBuf) -> Fs {
        Fs { root }
    }

    /// Joins a guest-side absolute path onto the chroot root, stripping any
    /// leading `/` so [Path::join] doesn't treat it as an absolute override.
    pub fn resolve(&self, guest_path: &str) -> PathBuf {
        self.root.join(guest_path.trim_start_matches('/'))
    }

    pub fn read(&self, guest_path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.resolve(guest_path))
    }

    pub fn exists(&self, guest_path: &str) -> bool {
        self.resolve(guest_path).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_absolute_guest_paths_under_root() {
        let fs = Fs::new(PathBuf::from("/srv/armv7"));
        assert_eq!(
            fs.resolve("/usr/lib/libSystem.B.dylib"),
            PathBuf::from("/srv/armv7/usr/lib/libSystem.B.dylib")
        );
    }
}
