fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/shardkv.proto");

    // Use protox (pure-Rust protobuf compiler) so no system `protoc` is needed.
    let fds = protox::compile(["proto/shardkv.proto"], ["proto/"])?;

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds(fds)?;

    Ok(())
}
