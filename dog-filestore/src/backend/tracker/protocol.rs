//! Line protocol spoken to trackers.
//!
//! A request is `<command> <k>=<v>&<k>=<v>\r\n` with url-encoded keys and
//! values. The tracker answers with one line: `OK <args>` or
//! `ERR <code> <message>`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{FileStoreError, FileStoreResult};

/// Error code a tracker returns for a key it does not know
pub const UNKNOWN_KEY: &str = "unknown_key";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Decoded tracker reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerReply {
    Ok(HashMap<String, String>),
    Err { code: String, message: String },
}

pub fn encode_request(command: &str, args: &[(&str, String)]) -> String {
    let encoded: Vec<String> = args
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    format!("{} {}\r\n", command, encoded.join("&"))
}

pub fn decode_args(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(&k.replace('+', " ")).ok()?.into_owned();
            let v = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
            Some((k, v))
        })
        .collect()
}

pub fn parse_reply(line: &str) -> FileStoreResult<TrackerReply> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix("OK") {
        return Ok(TrackerReply::Ok(decode_args(rest.trim_start())));
    }
    if let Some(rest) = line.strip_prefix("ERR") {
        let rest = rest.trim_start();
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        let message = urlencoding::decode(&message.replace('+', " "))
            .map(|m| m.into_owned())
            .unwrap_or_else(|_| message.to_string());
        return Ok(TrackerReply::Err {
            code: code.to_string(),
            message,
        });
    }
    Err(FileStoreError::backend_message(
        "tracker reply",
        "",
        format!("malformed tracker reply: {:?}", line),
    ))
}

/// Talks to the first reachable tracker, one connection per command
#[derive(Debug, Clone)]
pub struct TrackerClient {
    hosts: Vec<String>,
}

impl TrackerClient {
    pub fn new(hosts: Vec<String>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        Self { hosts }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Run `command`, reconnecting and retrying once on a transient socket
    /// failure. `ERR` replies are returned as-is for the caller to map.
    pub async fn call(
        &self,
        command: &'static str,
        locator: &str,
        args: &[(&str, String)],
    ) -> FileStoreResult<TrackerReply> {
        let request = encode_request(command, args);
        match self.exchange(command, locator, &request).await {
            Err(e) if e.is_retryable_socket() => {
                warn!("tracker {} for '{}' failed ({}), reconnecting and retrying", command, locator, e);
                self.exchange(command, locator, &request).await
            }
            other => other,
        }
    }

    /// Like `call`, but an `ERR` reply becomes an error; `unknown_key`
    /// maps to `NotFound`.
    pub async fn call_ok(
        &self,
        command: &'static str,
        locator: &str,
        args: &[(&str, String)],
    ) -> FileStoreResult<HashMap<String, String>> {
        match self.call(command, locator, args).await? {
            TrackerReply::Ok(reply) => Ok(reply),
            TrackerReply::Err { code, .. } if code == UNKNOWN_KEY => Err(FileStoreError::not_found(locator)),
            TrackerReply::Err { code, message } => Err(FileStoreError::backend_message(
                command,
                locator,
                format!("tracker error {}: {}", code, message),
            )),
        }
    }

    async fn connect(&self, command: &'static str, locator: &str) -> FileStoreResult<TcpStream> {
        let mut last_error = None;
        for host in &self.hosts {
            match TcpStream::connect(host.as_str()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("tracker {} unreachable: {}", host, e);
                    last_error = Some(e);
                }
            }
        }
        let cause = last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no tracker hosts configured")
        });
        Err(FileStoreError::io(command, locator, cause))
    }

    async fn exchange(&self, command: &'static str, locator: &str, request: &str) -> FileStoreResult<TrackerReply> {
        let round_trip = async {
            let stream = self.connect(command, locator).await?;
            let mut stream = BufReader::new(stream);
            stream
                .get_mut()
                .write_all(request.as_bytes())
                .await
                .map_err(|e| FileStoreError::io(command, locator, e))?;

            let mut line = String::new();
            let read = stream
                .read_line(&mut line)
                .await
                .map_err(|e| FileStoreError::io(command, locator, e))?;
            if read == 0 {
                return Err(FileStoreError::io(
                    command,
                    locator,
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "tracker closed the connection"),
                ));
            }
            debug!("tracker {} '{}' -> {}", command, locator, line.trim_end());
            parse_reply(&line)
        };

        match tokio::time::timeout(COMMAND_TIMEOUT, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(FileStoreError::io(
                command,
                locator,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "tracker did not answer"),
            )),
        }
    }
}
