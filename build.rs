fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/gateway.proto");

    // The mock gateway in the test harness needs the server half.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/gateway.proto"], &["proto"])?;
    Ok(())
}
