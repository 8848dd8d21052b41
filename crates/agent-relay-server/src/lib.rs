// Streaming sessions and the gRPC surface
pub mod configuration;
pub mod gitops;
pub mod service;
pub mod stream;

// Session building blocks
pub mod agentcfg;
pub mod api;
pub mod cache;
pub mod frames;
pub mod glob;
pub mod poll;
pub mod usage;
pub mod visitor;

// Backends and settings
pub mod config;
pub mod gitlab;
pub mod snapshot;

#[cfg(test)]
mod testing;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("agentrelay");
}

/// File descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("relay_descriptor");
