//! Runtime stub executed from inside a compressed binary.
//!
//! The stub locates the container embedded in its own file, decompresses
//! the payload into the content-addressed cache on a miss, and execs the
//! cached binary with the original arguments and environment. It takes
//! no arguments of its own.
//!
//! Deliberately light: no CLI parsing, no logging stack. Set
//! `BINFLATE_DEBUG=1` for diagnostics on stderr.

use std::process::ExitCode;

use binject_core::ops;

fn main() -> ExitCode {
    let debug = std::env::var_os("BINFLATE_DEBUG").is_some();

    if debug {
        match std::env::current_exe() {
            Ok(exe) => {
                eprintln!("debug: running from {}", exe.display());
                match ops::locate_container(&exe) {
                    Ok(offset) => eprintln!("debug: container at offset {offset}"),
                    Err(e) => eprintln!("debug: container scan: {e}"),
                }
            }
            Err(e) => eprintln!("debug: cannot resolve own path: {e}"),
        }
    }

    match ops::decompress_and_exec() {
        // Unreachable on Unix (exec replaces the process); the child's
        // exit code on Windows.
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("binflate: {e}");
            eprintln!("This binary may not be a valid compressed executable.");
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}
