//! Daemon Client
//!
//! Blocking client for the cachemarkd socket, used by the admin CLI.
//! Pushed challenges are not meant for admin connections and are skipped.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use cm_protocol::{
    AltInfo, Outbound, Request, RequestEnvelope, Response, ResponseData, TrackerStatus,
    MAX_MESSAGE_SIZE,
};
use tracing::trace;

use crate::constants::timing::CLIENT_TIMEOUT;
use crate::error::{CacheMarkError, Result};

/// Initial buffer size for responses
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Connection to the tracker daemon
pub struct DaemonClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl DaemonClient {
    /// Connect to the daemon socket at `path`
    pub fn connect(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CacheMarkError::DaemonNotAvailable);
        }

        let stream = UnixStream::connect(path).map_err(|e| {
            CacheMarkError::DaemonConnection(format!("{}: {}", path.display(), e))
        })?;
        let reader_stream = stream
            .try_clone()
            .map_err(|e| CacheMarkError::DaemonConnection(format!("clone socket: {}", e)))?;

        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
        reader_stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;

        Ok(Self {
            writer: stream,
            reader: BufReader::new(reader_stream),
        })
    }

    /// Send a request and wait for its response
    pub fn request(&mut self, req: Request) -> Result<ResponseData> {
        req.validate()
            .map_err(|e| CacheMarkError::IpcProtocol(format!("Request validation failed: {}", e)))?;

        let envelope = RequestEnvelope::new(req);
        let mut json = serde_json::to_vec(&envelope)?;
        json.push(b'\n');

        if json.len() > MAX_MESSAGE_SIZE {
            return Err(CacheMarkError::MessageTooLarge {
                size: json.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        self.writer.write_all(&json)?;

        loop {
            let mut line: Vec<u8> = Vec::with_capacity(INITIAL_BUFFER_SIZE);
            let read = self.reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                return Err(CacheMarkError::DaemonConnection(
                    "Daemon closed connection".to_string(),
                ));
            }
            if line.len() > MAX_MESSAGE_SIZE {
                return Err(CacheMarkError::MessageTooLarge {
                    size: line.len(),
                    max_size: MAX_MESSAGE_SIZE,
                });
            }

            let outbound: Outbound = serde_json::from_slice(&line)
                .map_err(|e| CacheMarkError::IpcProtocol(format!("Failed to parse response: {}", e)))?;

            let response = match outbound {
                Outbound::Challenge(challenge) => {
                    trace!(identity = %challenge.identity, "Skipping pushed challenge");
                    continue;
                }
                Outbound::Response(response) => response,
            };

            if response.id != envelope.id {
                return Err(CacheMarkError::IpcProtocol(format!(
                    "Response ID mismatch: expected {}, got {}",
                    envelope.id, response.id
                )));
            }

            return match response.response {
                Response::Ok(data) => {
                    verify_response_type(&envelope.request, &data)?;
                    Ok(data)
                }
                Response::Error { message } => Err(CacheMarkError::DaemonResponse(message)),
            };
        }
    }

    pub fn ping(&mut self) -> Result<()> {
        self.request(Request::Ping).map(|_| ())
    }

    pub fn version(&mut self) -> Result<String> {
        self.request(Request::Version)?
            .value
            .ok_or_else(|| CacheMarkError::DaemonResponse("missing version".into()))
    }

    pub fn alts(&mut self, identity: &str) -> Result<Vec<AltInfo>> {
        Ok(self
            .request(Request::GetAlts {
                identity: identity.to_string(),
            })?
            .alts
            .unwrap_or_default())
    }

    pub fn canonical(&mut self, identity: &str) -> Result<String> {
        self.request(Request::GetCanonical {
            identity: identity.to_string(),
        })?
        .canonical
        .ok_or_else(|| CacheMarkError::DaemonResponse("missing canonical identity".into()))
    }

    pub fn find_by_name(&mut self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .request(Request::FindByName {
                name: name.to_string(),
            })?
            .identities
            .unwrap_or_default())
    }

    pub fn status(&mut self) -> Result<TrackerStatus> {
        self.request(Request::Status)?
            .tracker
            .ok_or_else(|| CacheMarkError::DaemonResponse("missing status".into()))
    }
}

/// Check that the payload carries what the request asked for
fn verify_response_type(req: &Request, data: &ResponseData) -> Result<()> {
    let valid = match req {
        Request::Ping | Request::Version => data.value.is_some(),
        Request::Status => data.tracker.is_some(),
        Request::GetAlts { .. } => data.alts.is_some(),
        Request::GetCanonical { .. } => data.canonical.is_some(),
        Request::FindByName { .. } => data.identities.is_some(),
        Request::SessionStart { .. } | Request::ProbeResult { .. } => data.probe.is_some(),
        Request::SessionEnd { .. } => true,
    };

    if !valid {
        return Err(CacheMarkError::DaemonResponse(format!(
            "Response type mismatch: got {:?} for request {}",
            data,
            req.type_name()
        )));
    }
    Ok(())
}

/// Socket path to use when none is given explicitly
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(crate::constants::paths::SOCKET_PATH)
}
