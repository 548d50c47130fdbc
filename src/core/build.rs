//! Build script for Portunix Core
//!
//! Compiles the plugin wire contract with tonic-build to generate the
//! gRPC client used by the supervisor and the host-side service stub.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "proto/plugin.proto";

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());

    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let builder = tonic_build::configure()
        // The supervisor is a client of PortunixPlugin and a server of
        // PluginHost, and test plugins need the inverse, so build both.
        .build_server(true)
        .build_client(true)
        .build_transport(true)
        .compile_well_known_types(false)
        .out_dir(&out_dir)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(rename_all = \"camelCase\")]");

    builder.compile(&[proto_file], &["proto/"])?;

    println!("cargo:rerun-if-changed={}", proto_file);
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
