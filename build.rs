use std::env;

fn main() {
    println!("cargo:rerun-if-changed=src/helpers.c");

    let os = env::var("CARGO_CFG_TARGET_OS").unwrap();
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let mut build = cc::Build::new();
    build.warnings(true);
    build.define(&format!("CFG_TARGET_OS_{os}"), None);
    build.define(&format!("CFG_TARGET_ARCH_{arch}"), None);
    build.file("src/helpers.c");
    build.compile("wasmtime-traps-helpers");
}
