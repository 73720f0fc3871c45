//! Progress events reported to the application
//!
//! Every operation reports its lifecycle through one event stream. An event
//! names the operation it belongs to and carries a status specific to the
//! operation kind.

use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::HashCode;
use crate::metadata::MetaData;
use crate::uri::Uri;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Handle of a publish operation
    PublishId
);
handle_type!(
    /// Handle of a download, including probes and recursive children
    DownloadId
);
handle_type!(
    /// Handle of a keyword or namespace search
    SearchId
);
handle_type!(
    /// Handle of an unindex operation
    UnindexId
);
handle_type!(
    /// Handle of a standalone keyword or namespace block publication
    UBlockPublishId
);

/// A result within a search, identified by the key of its URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultId {
    pub search: SearchId,
    pub key: HashCode,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Publish(PublishEvent),
    Download(DownloadEvent),
    Search(SearchEvent),
    Unindex(UnindexEvent),
    UBlock(UBlockEvent),
}

#[derive(Debug, Clone)]
pub struct PublishEvent {
    pub id: PublishId,
    /// Position of the node in the file tree; empty for the root
    pub node: Vec<usize>,
    pub filename: Option<String>,
    pub size: u64,
    pub completed: u64,
    pub duration: Duration,
    pub anonymity: u32,
    pub status: PublishStatus,
}

impl PublishEvent {
    pub fn is_root(&self) -> bool {
        self.node.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishStatus {
    Start,
    Resume {
        chk_uri: Option<Uri>,
        message: Option<String>,
    },
    Suspend,
    Progress {
        offset: u64,
        data_len: usize,
        depth: u32,
    },
    Error {
        message: String,
    },
    Completed {
        chk_uri: Uri,
        sks_uri: Option<Uri>,
    },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub id: DownloadId,
    pub parent: Option<DownloadId>,
    pub search_result: Option<ResultId>,
    pub uri: Uri,
    pub filename: Option<PathBuf>,
    /// Bytes requested
    pub size: u64,
    pub completed: u64,
    pub duration: Duration,
    pub is_active: bool,
    pub anonymity: u32,
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    Start {
        meta: Option<MetaData>,
    },
    Resume {
        meta: Option<MetaData>,
        message: Option<String>,
    },
    Suspend,
    Progress {
        /// Decrypted block, empty when reconstructed from local data
        data: Bytes,
        offset: u64,
        depth: u32,
        /// Time since the block was requested; zero if found locally
        block_download_duration: Duration,
    },
    Error {
        message: String,
    },
    Completed,
    Stopped,
    Active,
    Inactive,
    /// The search this download was started from has been stopped
    LostParent,
}

#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub id: SearchId,
    pub query: Uri,
    /// Result whose update identifier spawned this search
    pub parent: Option<ResultId>,
    pub duration: Duration,
    pub anonymity: u32,
    pub status: SearchStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchStatus {
    Start,
    Resume {
        message: Option<String>,
    },
    ResumeResult {
        result: ResultId,
        uri: Uri,
        meta: MetaData,
        applicability_rank: u32,
        availability_rank: i32,
        availability_certainty: u32,
    },
    Suspend,
    ResultSuspend {
        result: ResultId,
    },
    Result {
        result: ResultId,
        uri: Uri,
        meta: MetaData,
        applicability_rank: u32,
    },
    Update {
        result: ResultId,
        uri: Uri,
        meta: MetaData,
        applicability_rank: u32,
        availability_rank: i32,
        availability_certainty: u32,
        current_probe_time: Duration,
    },
    Error {
        message: String,
    },
    Paused,
    Continued,
    ResultStopped {
        result: ResultId,
    },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct UnindexEvent {
    pub id: UnindexId,
    pub filename: PathBuf,
    pub size: u64,
    pub completed: u64,
    pub duration: Duration,
    pub status: UnindexStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnindexStatus {
    Start,
    Resume { message: Option<String> },
    Suspend,
    Progress { offset: u64, data_len: usize, depth: u32 },
    Error { message: String },
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UBlockEvent {
    pub id: UBlockPublishId,
    /// The KSK or SKS URI under which the target is now findable
    pub uri: Uri,
    pub result: Result<(), String>,
}

/// Key of the event's operation, handy for filtering in tests and UIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Publish(PublishId),
    Download(DownloadId),
    Search(SearchId),
    Unindex(UnindexId),
    UBlock(UBlockPublishId),
}

impl ProgressEvent {
    pub fn source(&self) -> EventSource {
        match self {
            ProgressEvent::Publish(e) => EventSource::Publish(e.id),
            ProgressEvent::Download(e) => EventSource::Download(e.id),
            ProgressEvent::Search(e) => EventSource::Search(e.id),
            ProgressEvent::Unindex(e) => EventSource::Unindex(e.id),
            ProgressEvent::UBlock(e) => EventSource::UBlock(e.id),
        }
    }

    /// Error message, if this is an error event
    pub fn error(&self) -> Option<&str> {
        match self {
            ProgressEvent::Publish(PublishEvent {
                status: PublishStatus::Error { message },
                ..
            })
            | ProgressEvent::Download(DownloadEvent {
                status: DownloadStatus::Error { message },
                ..
            })
            | ProgressEvent::Search(SearchEvent {
                status: SearchStatus::Error { message },
                ..
            })
            | ProgressEvent::Unindex(UnindexEvent {
                status: UnindexStatus::Error { message },
                ..
            }) => Some(message),
            ProgressEvent::UBlock(UBlockEvent {
                result: Err(message),
                ..
            }) => Some(message),
            _ => None,
        }
    }
}
