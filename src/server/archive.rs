//! Archiving of requests and responses.

use std::{error, fmt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use bytes::Bytes;
use log::debug;
use crate::commons::error::IoError;
use crate::commons::file;


//------------ ArchivableKind ------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchivableKind {
    Request,
    Response,
}

impl ArchivableKind {
    fn file_extension(self) -> &'static str {
        match self {
            ArchivableKind::Request => "request",
            ArchivableKind::Response => "response",
        }
    }
}

impl fmt::Display for ArchivableKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ArchivableKind::Request => "REQUEST",
            ArchivableKind::Response => "RESPONSE",
        })
    }
}


//------------ Archivable ----------------------------------------------------

/// Something a signer offers for archiving.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Archivable {
    pub kind: ArchivableKind,
    pub content_type: String,
    pub bytes: Bytes,
    pub archive_id: String,
}

impl Archivable {
    pub fn request(
        content_type: &str, bytes: Bytes, archive_id: &str
    ) -> Self {
        Archivable {
            kind: ArchivableKind::Request,
            content_type: content_type.to_string(),
            bytes,
            archive_id: archive_id.to_string(),
        }
    }

    pub fn response(
        content_type: &str, bytes: Bytes, archive_id: &str
    ) -> Self {
        Archivable {
            kind: ArchivableKind::Response,
            content_type: content_type.to_string(),
            bytes,
            archive_id: archive_id.to_string(),
        }
    }
}


//------------ Archiver ------------------------------------------------------

/// Where archived items end up.
#[derive(Debug)]
pub enum Archiver {
    /// Keeps everything in memory.
    Memory(Mutex<Vec<ArchivedItem>>),

    /// Writes every item to a file in a directory.
    Disk(PathBuf),
}

/// An item stored by [`Archiver::Memory`].
#[derive(Clone, Debug)]
pub struct ArchivedItem {
    pub worker_id: u32,
    pub transaction_id: String,
    pub archivable: Archivable,
}

impl Archiver {
    pub fn memory() -> Self {
        Archiver::Memory(Mutex::new(Vec::new()))
    }

    pub fn disk(dir: &Path) -> Result<Self, ArchiveError> {
        file::create_dir_all(dir)?;
        Ok(Archiver::Disk(dir.to_path_buf()))
    }

    /// Archives a single item.
    pub fn archive(
        &self,
        worker_id: u32,
        transaction_id: &str,
        archivable: &Archivable,
    ) -> Result<(), ArchiveError> {
        if archivable.archive_id.is_empty()
            || archivable.archive_id.contains(['/', '\\'])
            || archivable.archive_id.starts_with('.')
        {
            return Err(ArchiveError::InvalidArchiveId(
                archivable.archive_id.clone()
            ))
        }
        match self {
            Archiver::Memory(items) => {
                items.lock().unwrap().push(ArchivedItem {
                    worker_id,
                    transaction_id: transaction_id.to_string(),
                    archivable: archivable.clone(),
                });
            }
            Archiver::Disk(dir) => {
                let path = dir.join(worker_id.to_string()).join(format!(
                    "{}.{}",
                    archivable.archive_id,
                    archivable.kind.file_extension()
                ));
                file::save(&archivable.bytes, &path)?;
            }
        }
        debug!(
            "Archived {} for worker {} with archive id {}",
            archivable.kind, worker_id, archivable.archive_id
        );
        Ok(())
    }

    /// Returns the items archived in memory.
    ///
    /// Returns an empty list for a disk archiver.
    pub fn items(&self) -> Vec<ArchivedItem> {
        match self {
            Archiver::Memory(items) => items.lock().unwrap().clone(),
            Archiver::Disk(_) => Vec::new(),
        }
    }
}


//------------ ArchiveError --------------------------------------------------

#[derive(Debug)]
pub enum ArchiveError {
    Io(IoError),
    InvalidArchiveId(String),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "archiving failed: {err}"),
            ArchiveError::InvalidArchiveId(id) => {
                write!(f, "invalid archive id: '{id}'")
            }
        }
    }
}

impl error::Error for ArchiveError {}

impl From<IoError> for ArchiveError {
    fn from(err: IoError) -> Self {
        ArchiveError::Io(err)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn archive_to_disk() {
        let dir = test::tmp_dir();
        let archiver = Archiver::disk(dir.path()).unwrap();
        let request = Archivable::request(
            "application/timestamp-query", Bytes::from_static(b"req"), "0a1b"
        );
        let response = Archivable::response(
            "application/timestamp-reply", Bytes::from_static(b"resp"), "0a1b"
        );
        archiver.archive(7, "tx", &request).unwrap();
        archiver.archive(7, "tx", &response).unwrap();

        let worker_dir = dir.path().join("7");
        assert_eq!(
            file::read(&worker_dir.join("0a1b.request")).unwrap().as_ref(),
            b"req"
        );
        assert_eq!(
            file::read(&worker_dir.join("0a1b.response")).unwrap().as_ref(),
            b"resp"
        );
    }

    #[test]
    fn archive_in_memory() {
        let archiver = Archiver::memory();
        let item = Archivable::request(
            "application/octet-stream", Bytes::from_static(b"data"), "abc"
        );
        archiver.archive(1, "tx-1", &item).unwrap();
        let items = archiver.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].transaction_id, "tx-1");
        assert_eq!(items[0].archivable, item);
    }

    #[test]
    fn reject_path_like_ids() {
        let archiver = Archiver::memory();
        let item = Archivable::request(
            "application/octet-stream", Bytes::new(), "../escape"
        );
        assert!(matches!(
            archiver.archive(1, "tx", &item),
            Err(ArchiveError::InvalidArchiveId(_))
        ));
    }
}
