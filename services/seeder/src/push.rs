//! The HTTP push leg: stream file bytes into the relay's `PUT /{transfer}`.

use std::io::SeekFrom;
use std::path::Path;

use ferry_protocol::ByteRange;
use reqwest::header::CONTENT_LENGTH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{SeederError, share_url};

const PUSH_BLOCK_SIZE: usize = 16 * 1024;

/// Push the file (or the requested slice of it) for one transfer.
///
/// The size is taken from the file as it is *now*; when it differs from
/// what was registered, the relay adopts the new size and notifies us
/// with `update-file-size`.
pub async fn push_file(
    client: &reqwest::Client,
    service: &str,
    transfer_id: &str,
    path: &Path,
    range: Option<ByteRange>,
) -> Result<(), SeederError> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    let (start, push_len) = match range {
        None => (0, size),
        Some(range) => {
            let last = size.saturating_sub(1);
            let end = range.end.map_or(last, |e| e.min(last));
            let start = range.start.min(end);
            (start, end - start + 1)
        }
    };
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    let url = share_url(service, transfer_id);
    debug!(%url, start, push_len, "pushing bytes");

    let stream = ReaderStream::with_capacity(file.take(push_len), PUSH_BLOCK_SIZE);
    let response = client
        .put(&url)
        .header(CONTENT_LENGTH, push_len)
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .map_err(|e| SeederError::Transport(e.to_string()))?;

    if response.status().is_success() {
        info!(transfer_id, pushed = push_len, "push completed");
        Ok(())
    } else {
        Err(SeederError::Protocol(format!(
            "relay answered {} to the push",
            response.status()
        )))
    }
}
