fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    let well_known = protoc_bin_vendored::include_path()?;

    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure().compile(
        &[
            "proto/build/bazel/remote/execution/v2/remote_execution.proto",
            "proto/google/bytestream/bytestream.proto",
            "proto/kv_storage/kv_storage.proto",
            "proto/compilation_cache_service/cas/v1/cas.proto",
            "proto/compilation_cache_service/keyvalue/v1/keyvalue.proto",
            "proto/xcelerate/session/v1/session.proto",
            "proto/flarecache/storage/v1/storage.proto",
        ],
        &[std::path::PathBuf::from("proto"), well_known],
    )?;

    Ok(())
}
