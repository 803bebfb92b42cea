use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    // Only the firmware image links against cortex-m-rt's link.x, which
    // pulls in memory.x from the search path.
    if env::var_os("CARGO_FEATURE_SAMV71").is_none() {
        println!("cargo:rerun-if-changed=build.rs");
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    fs::copy("memory.x", out_dir.join("memory.x")).expect("memory.x is readable");
    println!("cargo:rustc-link-search={}", out_dir.display());
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");
}
