/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Error categories for the core (decoder, executor, loader, symbol table).
//!
//! Every fault here is meant to be fatal eventually: the core never recovers
//! guest state once one of these is raised, it only propagates with `?` up to
//! the step loop or the loader's top-level entry point, where it becomes a
//! process exit. See the top-level documentation for the rationale.

/// The error type threaded through the decoder, executor, loader and symbol
/// table via `Result<_, EmuError>`.
#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    #[error("decode-unreachable encoding at {source_address:#010x}: {detail}")]
    Decode {
        source_address: u32,
        detail: String,
    },

    #[error("UNPREDICTABLE at {source_address:#010x}: {detail}")]
    Unpredictable {
        source_address: u32,
        detail: String,
    },

    #[error("UNDEFINED at {source_address:#010x}: {detail}")]
    Undefined {
        source_address: u32,
        detail: String,
    },

    #[error("memory fault: {size}-byte access to unmapped address {addr:#010x}")]
    MemoryFault { addr: u32, size: u8 },

    #[error("unresolved external symbol: {name:?}")]
    UnresolvedSymbol { name: String },

    #[error("unimplemented opcode: {name} at {source_address:#010x}")]
    UnimplementedOpcode {
        name: &'static str,
        source_address: u32,
    },

    #[error("unimplemented host stub: {name:?}")]
    UnimplementedStub { name: String },

    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Structural failures while parsing a Mach-O image, a fat-binary wrapper, or
/// a dyld shared cache.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("not a recognised Mach-O or fat-binary magic number")]
    BadMagic,

    #[error("truncated or malformed load command")]
    TruncatedLoadCommand,

    #[error("no armv7 slice found in fat binary")]
    NoArmSlice,

    #[error("dylib not found in search root(s): {path}")]
    DylibNotFound { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Mach-O parse error: {0}")]
    MachO(String),
}
