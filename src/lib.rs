pub mod build {
    pub mod bazel {
        pub mod semver {
            tonic::include_proto!("build.bazel.semver");
        }
        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
    }
}
pub mod google {
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }
}
pub mod kv_storage {
    tonic::include_proto!("kv_storage");
}
pub mod compilation_cache_service {
    pub mod cas {
        pub mod v1 {
            tonic::include_proto!("compilation_cache_service.cas.v1");
        }
    }
    pub mod keyvalue {
        pub mod v1 {
            tonic::include_proto!("compilation_cache_service.keyvalue.v1");
        }
    }
}
pub mod xcelerate {
    pub mod session {
        pub mod v1 {
            tonic::include_proto!("xcelerate.session.v1");
        }
    }
}
pub mod storage_proto {
    tonic::include_proto!("flarecache.storage.v1");
}

pub mod bytestream;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod filegroup;
#[cfg(unix)]
pub mod proxy;
pub mod retry;
pub mod session;
pub mod stats;
pub mod transport;

pub use client::KvClient;
pub use error::{KvError, Result};
pub use filegroup::{FileGroup, FileGroupTransfer, FileInfo, TransferConfig};
pub use session::SessionState;
pub use stats::SessionStats;
