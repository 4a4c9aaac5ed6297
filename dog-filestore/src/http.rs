//! Plain HTTP transfers against storage nodes.
//!
//! Only responses that declare their length up front are accepted; a
//! chunked body or a missing `Content-Length` fails before any byte is
//! delivered.

use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::{ByteSink, ByteSource, FileStoreError, FileStoreResult};

/// Push the body at `url` into `sink` in runs of at most `quantum` bytes.
/// Returns the number of bytes delivered.
pub async fn fetch_to_sink(
    client: &reqwest::Client,
    url: &str,
    quantum: usize,
    sink: &mut dyn ByteSink,
) -> FileStoreResult<u64> {
    let quantum = quantum.max(1);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FileStoreError::backend("http get", url, e))?;

    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(FileStoreError::not_found(url));
    }
    if !status.is_success() {
        error!("GET {} returned {}", url, status);
        return Err(FileStoreError::backend_message(
            "http get",
            url,
            format!("unexpected HTTP status {}", status),
        ));
    }

    let headers = response.headers();
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Err(FileStoreError::Unsupported {
            operation: "chunked transfer encoding",
        });
    }
    let expected = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(FileStoreError::Unsupported {
            operation: "response without Content-Length",
        })?;

    debug!("GET {} streaming {} bytes", url, expected);
    let mut body = response.bytes_stream();
    let mut delivered = 0u64;
    while let Some(item) = body.next().await {
        let mut piece: Bytes = item.map_err(|e| FileStoreError::backend("http get", url, e))?;
        while !piece.is_empty() {
            let take = quantum.min(piece.len());
            let head = piece.split_to(take);
            delivered += head.len() as u64;
            sink.write(head).await?;
        }
    }

    if delivered != expected {
        return Err(FileStoreError::io(
            "http get",
            url,
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("body ended after {} of {} bytes", delivered, expected),
            ),
        ));
    }
    Ok(delivered)
}

/// Upload `source` to `url` with a declared `Content-Length` of `size`.
/// The source is drained one quantum at a time on a pump task, so at most
/// one quantum is buffered between the source and the socket.
pub async fn put_from_source(
    client: &reqwest::Client,
    url: &str,
    mut source: ByteSource,
    size: u64,
    quantum: usize,
) -> FileStoreResult<u64> {
    let quantum = quantum.max(1);
    let (mut tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);

    let pump = tokio::spawn(async move {
        let mut sent = 0u64;
        loop {
            match source.next_quantum(quantum).await {
                Ok(Some(piece)) => {
                    sent += piece.len() as u64;
                    if tx.send(Ok(piece)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, message)))
                        .await;
                    return Err(e);
                }
            }
        }
        source.finish().await?;
        Ok::<u64, FileStoreError>(sent)
    });

    let response = client
        .put(url)
        .header(CONTENT_LENGTH, size)
        .body(reqwest::Body::wrap_stream(rx))
        .send()
        .await;

    let sent = match pump.await {
        Ok(result) => result?,
        Err(e) => return Err(FileStoreError::backend("http put", url, e)),
    };
    let response = response.map_err(|e| FileStoreError::backend("http put", url, e))?;

    if !response.status().is_success() {
        error!("PUT {} returned {}", url, response.status());
        return Err(FileStoreError::backend_message(
            "http put",
            url,
            format!("unexpected HTTP status {}", response.status()),
        ));
    }
    if sent != size {
        return Err(FileStoreError::SizeMismatch {
            expected: size,
            actual: sent,
        });
    }
    debug!("PUT {} stored {} bytes", url, sent);
    Ok(sent)
}
