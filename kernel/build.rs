use std::{env, fs, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=kernel.ld");

    // The linker script only applies to the freestanding target.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    fs::copy("kernel.ld", out_dir.join("kernel.ld")).unwrap();
    println!("cargo:rustc-link-search={}", out_dir.display());
    println!("cargo:rustc-link-arg=-Tkernel.ld");
}
