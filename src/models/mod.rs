mod download;
mod lifecycle;
mod metadata;
mod source;

pub use download::{
    staging_path, ArtifactDownloader, DownloadError, DownloadSnapshot, DownloadState,
    ProgressCallback, DEFAULT_CHUNK_SIZE,
};
pub use lifecycle::{InferError, InitError, ModelLifecycle, ModelState, StateObserver};
pub use metadata::{checksum_matches, compute_sha256};
pub use source::{ByteSource, HttpSource, RemoteStream};
