//! GNFS Core
//!
//! Client side of the file-sharing service: the CHK tree codec, directory
//! and URI formats, and the publish, search, download and unindex state
//! machines together with their persistence.

pub mod bio;
pub mod block;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod download;
pub mod driver;
pub mod error;
pub mod events;
pub mod file_info;
pub mod fs;
pub mod metadata;
pub mod namespace;
pub mod pending;
pub mod persistence;
pub mod publish;
pub mod queue;
pub mod reader;
pub mod search;
pub mod service;
pub mod tree;
pub mod unindex;
pub mod uri;

pub use block::BlockType;
pub use config::{ConfigError, FsConfig};
pub use crypto::{ContentHashKey, HashCode};
pub use directory::{DirectoryBuilder, DirectoryEntry, DirectoryListing};
pub use download::{DownloadContext, DownloadOptions};
pub use driver::Driver;
pub use error::{FsError, Result};
pub use events::{
    DownloadEvent, DownloadId, DownloadStatus, EventSource, ProgressEvent, PublishEvent,
    PublishId, PublishStatus, ResultId, SearchEvent, SearchId, SearchStatus, UBlockEvent,
    UBlockPublishId, UnindexEvent, UnindexId, UnindexStatus,
};
pub use file_info::FileInformation;
pub use fs::Fs;
pub use metadata::{MetaData, MetaFormat, MetaType};
pub use namespace::UpdateInformation;
pub use publish::{NamespacePublish, PublishContext, PublishOptions};
pub use reader::{DataReader, FileReader, MemoryReader};
pub use search::{SearchContext, SearchOptions, SearchResult};
pub use service::{BlockOptions, MemoryService, Request, Response, Service};
pub use tree::{TreeEncoder, CHK_PER_INODE, DBLOCK_SIZE, MAX_INLINE_SIZE};
pub use unindex::{UnindexContext, UnindexState};
pub use uri::{NamespaceId, Uri};
