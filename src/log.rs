/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::sync::OnceLock;

/// Print a message (with implicit newline). This should be used for all
/// output that isn't part of a fatal-error report.
///
/// Prefer [log] or [log_dbg] for warnings and debug traces during emulation.
macro_rules! echo {
    ($($arg:tt)+) => {
        eprintln!($($arg)+)
    };
    () => {
        eprintln!()
    }
}

/// Prints a log message unconditionally. Use this for warnings.
///
/// The message is prefixed with the module path, so it is clear where it
/// comes from.
macro_rules! log {
    ($($arg:tt)+) => {
        echo!("{}: {}", module_path!(), format_args!($($arg)+));
    }
}

/// Like [log], but prints the message only if debugging is enabled for the
/// module where it is used. This can be used for verbose things only needed
/// when debugging, e.g. per-instruction tracing in the decoder/executor.
macro_rules! log_dbg {
    ($($arg:tt)+) => {
        if $crate::log::module_enabled(module_path!()) {
            log!($($arg)*);
        }
    }
}

static ENABLED_MODULES: OnceLock<Vec<String>> = OnceLock::new();

/// Called once at startup from `--log-modules`. Modules named here have their
/// [log_dbg] traces printed, e.g. "armvisor::loader" to see every symbol bind.
pub fn set_enabled_modules(modules: Vec<String>) {
    let _ = ENABLED_MODULES.set(modules);
}

pub fn module_enabled(module_path: &str) -> bool {
    ENABLED_MODULES
        .get()
        .is_some_and(|modules| modules.iter().any(|m| m == module_path))
}
