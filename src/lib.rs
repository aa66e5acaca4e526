/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! armvisor is a user-space emulator for armv7/Thumb-2 Mach-O binaries.
//!
//! In various places, the terms "guest" and "host" are used to distinguish
//! between the emulated binary (the "guest") and the emulator itself (the
//! "host"):
//! - The guest is a 32-bit program, so a guest address is always 32 bits.
//! - The host can read and write guest memory; the guest cannot see host
//!   memory at all.
//! - A "guest function" is emulated Arm code, usually from the loaded
//!   binary or one of its dylibs.
//! - A "host function" is a Rust function invoked from a breakpoint
//!   trampoline in place of a guest function the emulator doesn't implement.
//!
//! [Machine] is the single entry point that ties the pieces together:
//! [arm] and [decoder] turn bytes into [decoder::Instruction]s, [executor]
//! carries out their architectural effects, [mem] backs the address space
//! they operate on, and [dyld]/[mach_o]/[dyld_cache] load a binary and its
//! dependencies into that address space before execution begins.

#[macro_use]
pub mod log;
pub mod arm;
pub mod breakpoint;
pub mod cp15;
pub mod decoder;
pub mod dyld;
pub mod dyld_cache;
pub mod error;
pub mod executor;
pub mod fs;
pub mod mach_o;
pub mod machine;
pub mod mem;
pub mod options;
pub mod state;
pub mod symtab;
pub mod syscall;

pub use error::{EmuError, LoaderError};
pub use machine::Machine;
pub use options::Options;

/// Current version, from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
