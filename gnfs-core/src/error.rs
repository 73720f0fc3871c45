//! Crate-wide error type
//!
//! Failures of an operation that is already running are reported as error
//! progress events. `FsError` covers the calls that reject their arguments
//! up front and the loaders for persisted state.

use thiserror::Error;

use crate::bio::BioError;
use crate::block::BlockError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::directory::DirectoryError;
use crate::metadata::MetaError;
use crate::tree::TreeError;
use crate::uri::UriError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("URI error: {0}")]
    Uri(#[from] UriError),

    #[error("Metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("State file error: {0}")]
    Bio(#[from] BioError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Tree encoding error: {0}")]
    Tree(#[from] TreeError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown operation {0}")]
    UnknownOperation(String),
}

pub type Result<T> = std::result::Result<T, FsError>;
