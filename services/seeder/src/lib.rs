//! Command-line seeder: shares one local file through a relay.
//!
//! The seeder registers the file over the relay's WebSocket signalling
//! channel, prints the resulting share URL, and then answers every
//! `fileTransferNew` notification by pushing the file bytes (or the
//! requested byte range) with an HTTP `PUT`.  On transport loss it
//! reconnects and re-claims its id with the saved signature, so the
//! printed URL keeps working.

pub mod push;
pub mod session;

use std::path::{Path, PathBuf};

use ferry_protocol::SourceFlags;

#[derive(Debug, thiserror::Error)]
pub enum SeederError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid service URL '{0}': expected http:// or https://")]
    InvalidServiceUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("registration rejected: {0}")]
    Rejected(String),
}

/// The one file this process shares.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub path: PathBuf,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub flags: SourceFlags,
}

impl SharedFile {
    /// Inspect a local file; the registered size is re-checked before
    /// every push, so a file that grows in place keeps working.
    pub async fn open(path: &Path, public: bool) -> Result<Self, SeederError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(SeederError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is not a regular file", path.display()),
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        let mut flags = SourceFlags::CHUNKABLE;
        if public {
            flags = flags.union(SourceFlags::PUBLIC);
        }
        Ok(Self {
            path: path.to_owned(),
            name,
            content_type,
            size: metadata.len(),
            flags,
        })
    }
}

/// Derive the signalling endpoint from the service URL.
pub fn ws_service_url(service: &str) -> Result<String, SeederError> {
    let service = service.trim_end_matches('/');
    let rewritten = if let Some(rest) = service.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = service.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        return Err(SeederError::InvalidServiceUrl(service.to_owned()));
    };
    Ok(format!("{rewritten}/transport/ws"))
}

/// The share URL a leecher dereferences.
#[must_use]
pub fn share_url(service: &str, source_id: &str) -> String {
    format!("{}/{source_id}", service.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_the_service_scheme() {
        assert_eq!(
            ws_service_url("http://localhost:8080").unwrap(),
            "ws://localhost:8080/transport/ws"
        );
        assert_eq!(
            ws_service_url("https://ferry.example.com/").unwrap(),
            "wss://ferry.example.com/transport/ws"
        );
        assert!(matches!(
            ws_service_url("ftp://nope"),
            Err(SeederError::InvalidServiceUrl(_))
        ));
    }

    #[test]
    fn share_url_joins_without_doubled_slashes() {
        assert_eq!(
            share_url("http://localhost:8080/", "1a0abc"),
            "http://localhost:8080/1a0abc"
        );
    }

    #[tokio::test]
    async fn open_inspects_the_file_and_sets_flags() {
        let dir = std::env::temp_dir().join(format!("seeder-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let shared = SharedFile::open(&path, false).await.unwrap();
        assert_eq!(shared.name, "hello.txt");
        assert_eq!(shared.size, 5);
        assert_eq!(shared.content_type, "text/plain");
        assert!(shared.flags.contains(SourceFlags::CHUNKABLE));
        assert!(!shared.flags.contains(SourceFlags::PUBLIC));

        let public = SharedFile::open(&path, true).await.unwrap();
        assert!(public.flags.contains(SourceFlags::PUBLIC));

        tokio::fs::remove_dir_all(&dir).await.unwrap();

        assert!(SharedFile::open(Path::new("/definitely/not/here"), false)
            .await
            .is_err());
    }
}
