/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Parsing and management of user-configurable options for the `armvisor`
//! command line.

use std::path::PathBuf;

/// Struct containing all user-configurable options.
pub struct Options {
    /// `--steps=N`: stop after `N` instructions have been stepped. `None`
    /// means run until a fault (or `sys_exit`) ends the process.
    pub steps: Option<u64>,
    /// `--root=PATH`: chroot prefix dylib paths are resolved against.
    pub root: PathBuf,
    /// `--cache=PATH`: a `dyld_shared_cache_armv7` file to consult before
    /// falling back to `--root`.
    pub cache: Option<PathBuf>,
    /// `--log-modules=a,b,c`: module paths with `log_dbg!` tracing enabled.
    pub log_modules: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            steps: None,
            root: PathBuf::from("/"),
            cache: None,
            log_modules: Vec::new(),
        }
    }
}

impl Options {
    /// Parse the command-line argument syntax for an option. Returns `Ok(true)`
    /// if the option was valid and has been applied, or `Ok(false)` if the
    /// option was not recognized.
    pub fn parse_argument(&mut self, arg: &str) -> Result<bool, String> {
        if let Some(value) = arg.strip_prefix("--steps=") {
            let steps: u64 = value
                .parse()
                .map_err(|_| "Invalid value for --steps=".to_string())?;
            self.steps = Some(steps);
        } else if let Some(value) = arg.strip_prefix("--root=") {
            self.root = PathBuf::from(value);
        } else if let Some(value) = arg.strip_prefix("--cache=") {
            self.cache = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--log-modules=") {
            self.log_modules = value.split(',').map(ToOwned::to_owned).collect();
        } else {
            return Ok(false);
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_argument_is_reported_unhandled() {
        let mut options = Options::default();
        assert_eq!(options.parse_argument("--bogus").unwrap(), false);
    }

    #[test]
    fn steps_and_root_are_parsed() {
        let mut options = Options::default();
        assert!(options.parse_argument("--steps=1000").unwrap());
        assert!(options.parse_argument("--root=/srv/armv7").unwrap());
        assert_eq!(options.steps, Some(1000));
        assert_eq!(options.root, PathBuf::from("/srv/armv7"));
    }

    #[test]
    fn log_modules_are_split_on_comma() {
        let mut options = Options::default();
        options.parse_argument("--log-modules=armvisor::dyld,armvisor::executor").unwrap();
        assert_eq!(options.log_modules, vec!["armvisor::dyld", "armvisor::executor"]);
    }
}
