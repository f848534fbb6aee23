// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-check-cfg=cfg(tether_payload)");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let linker_script = manifest_dir.join("kernel.ld");
    println!("cargo:rerun-if-changed={}", linker_script.display());
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        // Use canonicalize to ensure only a single absolute path reaches the linker
        let abs_script = linker_script.canonicalize().expect("kernel.ld must exist");
        println!("cargo:rustc-link-arg=-T{}", abs_script.display());
    }

    // Optional statically linked runtime image handed to the ELF loader.
    println!("cargo:rerun-if-env-changed=TETHER_PAYLOAD");
    if let Ok(payload) = env::var("TETHER_PAYLOAD") {
        let path = PathBuf::from(payload).canonicalize().expect("TETHER_PAYLOAD must exist");
        println!("cargo:rerun-if-changed={}", path.display());
        println!("cargo:rustc-env=TETHER_PAYLOAD_PATH={}", path.display());
        println!("cargo:rustc-cfg=tether_payload");
    }
}
