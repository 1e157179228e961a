//! Compiles the region RPC protobuf definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_file = "proto/region.proto";
    println!("cargo:rerun-if-changed={}", proto_file);

    // Vendored protoc, so no system install is needed.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &["proto"])?;
    Ok(())
}
