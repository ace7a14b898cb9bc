use std::env;

use cbindgen::{Builder, Config};

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR is not set: {}", e);
            return;
        }
    };

    let config = match Config::from_file("cbindgen.toml") {
        Ok(config) => config,
        Err(e) => {
            println!("cargo:warning=Unable to read cbindgen.toml: {}", e);
            return;
        }
    };

    // Header generation is best effort.
    match Builder::new().with_crate(crate_dir).with_config(config).generate() {
        Ok(bindings) => {
            bindings.write_to_file("bindings.h");
        }
        Err(e) => println!("cargo:warning=Unable to generate bindings: {}", e),
    }
}
