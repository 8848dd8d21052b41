use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_client(false)
        .file_descriptor_set_path(out_dir.join("relay_descriptor.bin"))
        .compile_protos(&["proto/relay.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/relay.proto");
    Ok(())
}
