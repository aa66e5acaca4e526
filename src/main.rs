/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use armvisor::dyld_cache::DyldCache;
use armvisor::fs::Fs;
use armvisor::{dyld, log, machine::Machine, options::Options, VERSION};
use std::path::PathBuf;

const USAGE: &str = "\
Usage:
    armvisor path/to/binary

General options:
    --help
        Display this help text.

    --steps=N
        Stop after N instructions have been stepped. Without this, the
        guest runs until it faults or calls exit().

    --root=PATH
        Chroot prefix dylib load-command paths are resolved against.
        Defaults to the host's own root.

    --cache=PATH
        A dyld_shared_cache_armv7 file to consult for dylibs before falling
        back to --root.

    --log-modules=a,b,c
        Comma-separated module paths (e.g. armvisor::dyld) to print debug
        traces for.
";

fn main() -> Result<(), String> {
    println!("armvisor {VERSION}");

    let mut args = std::env::args();
    let _ = args.next().unwrap(); // skip argv[0]

    let mut binary_path: Option<PathBuf> = None;
    let mut options = Options::default();

    for arg in args {
        if arg == "--help" {
            println!("{USAGE}");
            return Ok(());
        } else if options.parse_argument(&arg)? {
            // applied in place, nothing further to do
        } else if binary_path.is_none() {
            binary_path = Some(PathBuf::from(arg));
        } else {
            eprintln!("{USAGE}");
            return Err(format!("Unexpected argument: {arg:?}"));
        }
    }

    let Some(binary_path) = binary_path else {
        eprintln!("{USAGE}");
        return Err("Path to a Mach-O binary must be specified".to_string());
    };

    log::set_enabled_modules(options.log_modules.clone());

    let cache = options
        .cache
        .as_deref()
        .map(DyldCache::load)
        .transpose()
        .map_err(|e| format!("Could not load dyld shared cache: {e}"))?;
    let fs = Fs::new(options.root.clone());

    let mut machine = Machine::new();
    dyld::load_main(&mut machine, &fs, cache.as_ref(), &binary_path)
        .map_err(|e| format!("Could not load {}: {e}", binary_path.display()))?;

    eprintln!("CPU emulation begins now.");
    let run_result = match options.steps {
        Some(steps) => machine.run(steps),
        None => machine.run_unbounded(),
    };

    match run_result {
        Ok(()) => Ok(()),
        Err(e) => Err(format!("Emulation aborted: {e}")),
    }
}
