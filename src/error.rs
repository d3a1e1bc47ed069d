use std::path::PathBuf;
use thiserror::Error;

/// Content extraction failures. These never escape the extractor; they are
/// attached to the (possibly empty) extracted content instead.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not decode {0} as UTF-8 or GB18030, used lossy decoding")]
    LossyDecode(PathBuf),

    #[error("media probe failed: {0}")]
    Probe(#[from] ProbeError),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ffprobe exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unreadable ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no video stream found")]
    NoVideoStream,

    #[error("ffprobe timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("embedder returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedder timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown file type in catalog: {0}")]
    UnknownFileType(String),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("corpus root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("not a vector index file: {0}")]
    BadMagic(PathBuf),

    #[error("unsupported vector index version {0}")]
    UnsupportedVersion(u32),

    #[error("vector index is truncated or corrupt: expected {expected} bytes, found {found}")]
    Corrupt { expected: usize, found: usize },

    #[error("query has dimension {query}, index has dimension {index}")]
    DimensionMismatch { query: usize, index: usize },

    #[error("invalid vector matrix: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate corpus key: {0}")]
    DuplicateKey(String),

    #[error("corpus {0} has no allowed extensions")]
    NoExtensions(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
