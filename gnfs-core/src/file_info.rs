//! Description of the files and directories to publish
//!
//! A `FileInformation` tree is handed to `publish_start` and is owned by the
//! publish operation from then on. Leaves are files backed by a
//! [`DataReader`]; interior nodes are directories whose serialized form is
//! built from their children once those have been encoded.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};

use crate::crypto::HashCode;
use crate::error::{FsError, Result};
use crate::metadata::{MetaData, MetaType};
use crate::reader::{DataReader, FileReader, MemoryReader};
use crate::service::BlockOptions;
use crate::uri::Uri;

pub enum FileKind {
    File {
        reader: Box<dyn DataReader>,
        size: u64,
        /// Index the file instead of inserting its blocks
        do_index: bool,
        /// Hash of the whole file, once known
        file_id: Option<HashCode>,
        /// The service accepted the index request
        index_start_confirmed: bool,
    },
    Directory {
        children: Vec<FileInformation>,
        /// Serialized directory, built when the directory is encoded
        dir_data: Option<Bytes>,
    },
}

pub struct FileInformation {
    pub(crate) meta: MetaData,
    pub(crate) keywords: Option<Uri>,
    pub(crate) options: BlockOptions,
    pub(crate) filename: Option<PathBuf>,
    pub(crate) chk_uri: Option<Uri>,
    pub(crate) sks_uri: Option<Uri>,
    pub(crate) emsg: Option<String>,
    pub(crate) is_published: bool,
    pub(crate) start_time: Instant,
    pub(crate) serialization: Option<String>,
    pub(crate) kind: FileKind,
}

impl std::fmt::Debug for FileInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInformation")
            .field("filename", &self.filename)
            .field("size", &self.size())
            .field("is_directory", &self.is_directory())
            .field("chk_uri", &self.chk_uri)
            .finish()
    }
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl FileInformation {
    fn new(
        kind: FileKind,
        meta: Option<MetaData>,
        keywords: Option<Uri>,
        options: BlockOptions,
        filename: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(kw) = &keywords {
            if !kw.is_ksk() {
                return Err(FsError::InvalidArgument(format!(
                    "`{}' is not a keyword URI",
                    kw
                )));
            }
        }
        Ok(FileInformation {
            meta: meta.unwrap_or_default(),
            keywords,
            options,
            filename,
            chk_uri: None,
            sks_uri: None,
            emsg: None,
            is_published: false,
            start_time: Instant::now(),
            serialization: None,
            kind,
        })
    }

    /// Publish the file at `path`
    pub fn from_file(
        path: impl Into<PathBuf>,
        keywords: Option<Uri>,
        meta: Option<MetaData>,
        do_index: bool,
        options: BlockOptions,
    ) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let mut meta = meta.unwrap_or_default();
        if meta.original_filename().is_none() {
            if let Some(name) = base_name(&path) {
                meta.insert_str(MetaType::OriginalFilename, &name);
            }
        }
        debug!(path = %path.display(), size, do_index, "File information from file");
        Self::new(
            FileKind::File {
                reader: Box::new(FileReader::new(&path)),
                size,
                do_index,
                file_id: None,
                index_start_confirmed: false,
            },
            Some(meta),
            keywords,
            options,
            Some(path),
        )
    }

    /// Publish an in-memory buffer; always inserted
    pub fn from_data(
        data: impl Into<Bytes>,
        keywords: Option<Uri>,
        meta: Option<MetaData>,
        options: BlockOptions,
    ) -> Result<Self> {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(
            FileKind::File {
                reader: Box::new(MemoryReader::new(data)),
                size,
                do_index: false,
                file_id: None,
                index_start_confirmed: false,
            },
            meta,
            keywords,
            options,
            None,
        )
    }

    /// Publish `size` bytes produced by a custom reader
    ///
    /// Indexing needs a file on disk, so it is only honoured for readers
    /// that report a path.
    pub fn from_reader(
        size: u64,
        reader: Box<dyn DataReader>,
        keywords: Option<Uri>,
        meta: Option<MetaData>,
        do_index: bool,
        options: BlockOptions,
    ) -> Result<Self> {
        let filename = reader.path().map(Path::to_path_buf);
        if do_index && filename.is_none() {
            return Err(FsError::InvalidArgument(
                "indexing requires a reader backed by a file".into(),
            ));
        }
        Self::new(
            FileKind::File {
                reader,
                size,
                do_index,
                file_id: None,
                index_start_confirmed: false,
            },
            meta,
            keywords,
            options,
            filename,
        )
    }

    pub fn empty_directory(
        keywords: Option<Uri>,
        meta: Option<MetaData>,
        options: BlockOptions,
        filename: Option<PathBuf>,
    ) -> Result<Self> {
        let mut meta = meta.unwrap_or_default();
        meta.make_directory();
        Self::new(
            FileKind::Directory {
                children: Vec::new(),
                dir_data: None,
            },
            Some(meta),
            keywords,
            options,
            filename,
        )
    }

    /// Append a child to a directory
    pub fn add(&mut self, child: FileInformation) -> Result<()> {
        match &mut self.kind {
            FileKind::Directory { children, dir_data } => {
                *dir_data = None;
                children.push(child);
                Ok(())
            }
            FileKind::File { .. } => Err(FsError::InvalidArgument(
                "cannot add an entry to a file".into(),
            )),
        }
    }

    /// Scan a local directory tree, deriving keywords from file names
    pub fn create_from_directory(
        path: impl AsRef<Path>,
        do_index: bool,
        options: BlockOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut meta = MetaData::new();
        if let Some(name) = base_name(path) {
            meta.insert_str(MetaType::OriginalFilename, &format!("{}/", name));
        }
        let keywords = Some(Uri::ksk_from_metadata(&meta));
        let mut dir =
            Self::empty_directory(keywords, Some(meta), options, Some(path.to_path_buf()))?;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        for entry in entries {
            let child = if entry.is_dir() {
                Self::create_from_directory(&entry, do_index, options)?
            } else {
                let mut meta = MetaData::new();
                if let Some(name) = base_name(&entry) {
                    meta.insert_str(MetaType::OriginalFilename, &name);
                }
                let keywords = Some(Uri::ksk_from_metadata(&meta));
                Self::from_file(&entry, keywords, Some(meta), do_index, options)?
            };
            trace!(path = %entry.display(), "Scanned directory entry");
            dir.add(child)?;
        }
        Ok(dir)
    }

    /// Visit this node and its descendants in pre-order
    ///
    /// The callback receives the depth of the node; returning false skips
    /// the children of that node.
    pub fn inspect<F>(&self, f: &mut F)
    where
        F: FnMut(&FileInformation, usize) -> bool,
    {
        self.inspect_at(0, f);
    }

    fn inspect_at<F>(&self, depth: usize, f: &mut F)
    where
        F: FnMut(&FileInformation, usize) -> bool,
    {
        if !f(self, depth) {
            return;
        }
        if let FileKind::Directory { children, .. } = &self.kind {
            for child in children {
                child.inspect_at(depth + 1, f);
            }
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory { .. })
    }

    /// Bytes this node publishes; directories count once their blob exists
    pub fn size(&self) -> u64 {
        match &self.kind {
            FileKind::File { size, .. } => *size,
            FileKind::Directory { dir_data, .. } => {
                dir_data.as_ref().map_or(0, |d| d.len() as u64)
            }
        }
    }

    /// Sum of all file sizes below this node
    pub fn contents_size(&self) -> u64 {
        match &self.kind {
            FileKind::File { size, .. } => *size,
            FileKind::Directory { children, .. } => {
                children.iter().map(FileInformation::contents_size).sum()
            }
        }
    }

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaData {
        &mut self.meta
    }

    pub fn keywords(&self) -> Option<&Uri> {
        self.keywords.as_ref()
    }

    pub fn set_keywords(&mut self, keywords: Option<Uri>) {
        self.keywords = keywords;
    }

    pub fn options(&self) -> &BlockOptions {
        &self.options
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: Option<PathBuf>) {
        self.filename = filename;
    }

    pub fn chk_uri(&self) -> Option<&Uri> {
        self.chk_uri.as_ref()
    }

    pub fn sks_uri(&self) -> Option<&Uri> {
        self.sks_uri.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.emsg.as_deref()
    }

    pub fn children(&self) -> &[FileInformation] {
        match &self.kind {
            FileKind::Directory { children, .. } => children,
            FileKind::File { .. } => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut [FileInformation] {
        match &mut self.kind {
            FileKind::Directory { children, .. } => children,
            FileKind::File { .. } => &mut [],
        }
    }

    /// Node at `path`, a list of child indices from this node
    pub(crate) fn node(&self, path: &[usize]) -> Option<&FileInformation> {
        let mut node = self;
        for &i in path {
            node = node.children().get(i)?;
        }
        Some(node)
    }

    pub(crate) fn node_mut(&mut self, path: &[usize]) -> Option<&mut FileInformation> {
        let mut node = self;
        for &i in path {
            node = node.children_mut().get_mut(i)?;
        }
        Some(node)
    }

    /// Paths of all nodes in pre-order, the root first
    pub(crate) fn paths(&self) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let mut stack = vec![Vec::new()];
        while let Some(path) = stack.pop() {
            if let Some(node) = self.node(&path) {
                for i in (0..node.children().len()).rev() {
                    let mut child = path.clone();
                    child.push(i);
                    stack.push(child);
                }
            }
            out.push(path);
        }
        out
    }

    /// Number of keywords this node will be published under
    pub(crate) fn keyword_count(&self) -> usize {
        self.keywords.as_ref().map_or(0, |k| k.keywords().len())
    }
}
