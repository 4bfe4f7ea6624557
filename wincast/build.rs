use std::{env, path::Path};

fn main() {
    let dest = Path::new(&env::var("OUT_DIR").expect("OUT_DIR not set")).join("built.rs");
    built::write_built_file_with_opts(Some(Path::new("..")), &dest)
        .expect("Failed to acquire build-time information");
}
