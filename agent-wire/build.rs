use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let iface_files = &["../proto/riemann.proto"];
    let dirs = &["../proto"];

    prost_build::compile_protos(iface_files, dirs)?;

    for file in iface_files {
        println!("cargo:rerun-if-changed={}", file);
    }

    Ok(())
}
