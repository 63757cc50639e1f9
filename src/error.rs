use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("no catalog configured")]
    #[diagnostic(help("pass --catalog or set \"catalog\" in kira-dd.json"))]
    MissingCatalog,

    #[error("failed to read catalog at {0}")]
    CatalogRead(PathBuf),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("invalid identifier value: {0}")]
    InvalidIdentifier(String),

    #[error("invalid output structure: {0}")]
    InvalidPathTemplate(String),

    #[error("invalid chunk selection: chunk {index} of {total}")]
    #[diagnostic(help("--chunk-index must be smaller than --total-chunks, which must be at least 1"))]
    InvalidChunk { index: usize, total: usize },

    #[error("found {count} archives without checksums")]
    #[diagnostic(help(
        "checksum enforcement is on; pass --ignore-checksum to download them anyway\n{sample}"
    ))]
    MissingChecksums { count: usize, sample: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("aria2 RPC request failed: {0}")]
    Aria2Rpc(String),

    #[error("aria2 RPC returned error {code}: {message}")]
    Aria2Status { code: i64, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("payload {0} not found inside extracted archive")]
    PayloadMissing(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker pool error: {0}")]
    ThreadPool(String),
}
