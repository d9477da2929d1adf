//! Unix Socket Server
//!
//! Serves two kinds of peers over one newline-delimited JSON protocol:
//!
//! - the **transport bridge**, which reports session and probe events and
//!   receives pushed challenges on the same connection
//! - **admin clients**, which query alts, canonical accounts and status
//!
//! # Connection model
//! - One reader loop per connection; responses and challenges share a
//!   single writer task so a response always precedes the challenges it causes
//! - Detection challenges are paced by a task per identity, aborted when the
//!   session is replaced or ended
//! - Closing a connection ends every session that was started on it
//!
//! # Limits
//! - Maximum concurrent connections
//! - Maximum message size, enforced before buffering a full line
//! - Write timeout per message

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use cm_core::{
    issue_all, Challenge, ChallengeSink, IdentityId, ProbeOutcome, ProbeProgress, Tracker,
};
use cm_error::CacheMarkError;
use cm_protocol::{
    Outbound, ProbeAck, ProbeState, Request, RequestEnvelope, Response, ResponseData,
    ResponseEnvelope,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use cm_core::constants::timing::WRITE_TIMEOUT;

/// Maximum message size in bytes
const MAX_MESSAGE_SIZE: usize = cm_protocol::MAX_MESSAGE_SIZE;

/// Socket permissions (owner and group read/write)
const SOCKET_MODE: u32 = 0o660;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// State shared by every connection
pub struct DaemonState {
    tracker: Arc<Tracker>,
    pacing: Duration,
    max_connections: usize,
    active_connections: AtomicUsize,
}

impl DaemonState {
    pub fn new(tracker: Arc<Tracker>, pacing: Duration, max_connections: usize) -> Self {
        Self {
            tracker,
            pacing,
            max_connections,
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }
}

// ============================================================================
// Socket setup
// ============================================================================

/// Bind the listening socket, replacing a stale socket file
pub fn bind_socket(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if let Ok(metadata) = socket_path.symlink_metadata() {
        // Refuse to remove symlinks (prevent symlink attacks)
        if metadata.file_type().is_symlink() {
            bail!(
                "Socket path {} is a symlink - refusing for security",
                socket_path.display()
            );
        }
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("Failed to set permissions on {}", socket_path.display()))?;

    info!(path = %socket_path.display(), "Listening (mode {:o})", SOCKET_MODE);
    Ok(listener)
}

// ============================================================================
// Server
// ============================================================================

/// Accept connections until `shutdown` resolves
pub async fn run_server<F>(listener: UnixListener, state: Arc<DaemonState>, shutdown: F)
where
    F: std::future::Future<Output = ()>,
{
    info!(
        max_conn = state.max_connections,
        max_msg = MAX_MESSAGE_SIZE,
        pacing_ms = state.pacing.as_millis() as u64,
        "Server ready"
    );

    tokio::pin!(shutdown);
    let mut total_connections: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = state.active_connections.load(Ordering::SeqCst);
                        if current >= state.max_connections {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        state.active_connections.fetch_add(1, Ordering::SeqCst);
                        total_connections += 1;
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_client(stream, Arc::clone(&state)).await;
                            state.active_connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(total_connections, "Server stopped");
}

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

/// Serve one connection until EOF or a fatal read error
pub async fn handle_client(stream: UnixStream, state: Arc<DaemonState>) {
    let peer = stream
        .peer_cred()
        .map(|c| format!("uid={} pid={}", c.uid(), c.pid().unwrap_or(-1)))
        .unwrap_or_else(|_| "unknown".to_string());
    debug!(peer = %peer, "Client connected");

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut connection = Connection::new(Arc::clone(&state), Arc::new(ConnectionSink { tx }));
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        match read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE).await {
            Ok(0) => break,
            Ok(n) => {
                request_count += 1;
                trace!(peer = %peer, bytes = n, "Request #{}", request_count);

                match std::str::from_utf8(&line) {
                    Ok(text) => connection.handle_line(text).await,
                    Err(_) => {
                        connection.respond(0, Response::error("Invalid request encoding"));
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!(peer = %peer, "Message too large (>{} bytes)", MAX_MESSAGE_SIZE);
                connection.respond(0, Response::error("Message too large"));
                break;
            }
            Err(e) => {
                error!(peer = %peer, "Read error: {}", e);
                break;
            }
        }
    }

    let ended = connection.close();
    debug!(
        peer = %peer,
        requests = request_count,
        duration = ?connection_start.elapsed(),
        sessions_ended = ended,
        "Client disconnected"
    );

    // Dropping the last sender lets the writer drain and stop
    drop(connection);
    let _ = writer_task.await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(message) = rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };

        let write_result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            Ok::<_, std::io::Error>(())
        })
        .await;

        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write error: {}", e);
                break;
            }
            Err(_) => {
                warn!("Write timeout");
                break;
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Pushes challenges onto a connection's writer
struct ConnectionSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSink {
    fn send(&self, message: Outbound) -> bool {
        self.tx.send(message).is_ok()
    }
}

impl ChallengeSink for ConnectionSink {
    fn issue_challenge(&self, challenge: &Challenge) -> cm_error::Result<()> {
        if self.send(Outbound::Challenge(challenge.to_message())) {
            Ok(())
        } else {
            Err(CacheMarkError::transport("connection closed"))
        }
    }
}

/// A session started through this connection
struct OwnedSession {
    epoch: u64,
    pacing: Option<JoinHandle<()>>,
}

impl OwnedSession {
    fn stop_pacing(&mut self) {
        if let Some(handle) = self.pacing.take() {
            handle.abort();
        }
    }
}

/// Work that must happen after the response is queued
enum Followup {
    Detection {
        identity: IdentityId,
        epoch: u64,
        challenges: Vec<Challenge>,
    },
    Marking {
        identity: IdentityId,
        challenges: Vec<Challenge>,
    },
}

struct Connection {
    state: Arc<DaemonState>,
    sink: Arc<ConnectionSink>,
    sessions: HashMap<IdentityId, OwnedSession>,
}

impl Connection {
    fn new(state: Arc<DaemonState>, sink: Arc<ConnectionSink>) -> Self {
        Self {
            state,
            sink,
            sessions: HashMap::new(),
        }
    }

    fn respond(&self, id: u64, response: Response) {
        self.sink
            .send(Outbound::Response(ResponseEnvelope::new(id, response)));
    }

    async fn handle_line(&mut self, line: &str) {
        let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
            Ok(e) => e,
            Err(e) => {
                debug!("Invalid JSON: {}", e);
                self.respond(0, Response::error("Invalid request format"));
                return;
            }
        };

        let request_id = envelope.id;
        let request = envelope.request;

        if let Err(e) = request.validate() {
            warn!(request = request.type_name(), "Request validation failed: {}", e);
            self.respond(request_id, Response::error(e));
            return;
        }

        trace!(request = request.type_name(), id = request_id, "Processing");
        let (response, followup) = self.dispatch(request).await;
        self.respond(request_id, response);

        match followup {
            Some(Followup::Detection {
                identity,
                epoch,
                challenges,
            }) => self.start_pacing(identity, epoch, challenges),
            Some(Followup::Marking {
                identity,
                challenges,
            }) => {
                if let Err(e) = issue_all(self.sink.as_ref(), &challenges) {
                    warn!(identity = %identity, "Failed to issue marking challenges: {}", e);
                }
            }
            None => {}
        }
    }

    async fn dispatch(&mut self, request: Request) -> (Response, Option<Followup>) {
        let tracker = Arc::clone(&self.state.tracker);
        let total = tracker.probe_count() as u32;

        match request {
            Request::Ping => (Response::ok_string("pong"), None),

            Request::Version => (Response::ok_string(VERSION), None),

            Request::Status => (Response::Ok(ResponseData::status(tracker.status())), None),

            Request::SessionStart {
                identity,
                display_name,
            } => {
                let identity = IdentityId::from(identity);
                let id = identity.clone();
                let started =
                    off_worker(&tracker, move |t| t.session_start(&id, &display_name)).await;
                match started {
                    Ok(started) => {
                        if let Some(mut old) = self.sessions.remove(&identity) {
                            old.stop_pacing();
                        }
                        self.sessions.insert(
                            identity.clone(),
                            OwnedSession {
                                epoch: started.epoch,
                                pacing: None,
                            },
                        );
                        let ack = ProbeAck {
                            state: ProbeState::Pending,
                            resolved: 0,
                            total,
                            fingerprint: None,
                        };
                        (
                            Response::Ok(ResponseData::probe_ack(ack)),
                            Some(Followup::Detection {
                                identity,
                                epoch: started.epoch,
                                challenges: started.challenges,
                            }),
                        )
                    }
                    Err(e) => {
                        warn!(identity = %identity, "Failed to start session: {}", e);
                        (Response::error(e.to_string()), None)
                    }
                }
            }

            Request::SessionEnd { identity } => {
                let identity = IdentityId::from(identity);
                if let Some(mut owned) = self.sessions.remove(&identity) {
                    owned.stop_pacing();
                }
                tracker.session_end(&identity);
                (Response::ok(), None)
            }

            Request::ProbeResult {
                identity,
                probe_id,
                outcome,
            } => {
                let identity = IdentityId::from(identity);
                let id = identity.clone();
                let outcome = ProbeOutcome::from(outcome);
                let progress =
                    off_worker(&tracker, move |t| t.probe_result(&id, probe_id as usize, outcome))
                        .await;

                match progress {
                    Ok(ProbeProgress::Ignored(reason)) => {
                        trace!(identity = %identity, probe_id, ?reason, "Probe result ignored");
                        (Response::Ok(ResponseData::probe_ack(ack(ProbeState::Ignored, 0, total, None))), None)
                    }
                    Ok(ProbeProgress::Pending { resolved, total }) => (
                        Response::Ok(ResponseData::probe_ack(ack(
                            ProbeState::Pending,
                            resolved as u32,
                            total as u32,
                            None,
                        ))),
                        None,
                    ),
                    Ok(ProbeProgress::Returning { fingerprint }) => {
                        self.forget(&identity);
                        (
                            Response::Ok(ResponseData::probe_ack(ack(
                                ProbeState::Returning,
                                total,
                                total,
                                Some(fingerprint.bits()),
                            ))),
                            None,
                        )
                    }
                    Ok(ProbeProgress::Marked {
                        fingerprint,
                        challenges,
                    }) => {
                        self.forget(&identity);
                        (
                            Response::Ok(ResponseData::probe_ack(ack(
                                ProbeState::Marked,
                                total,
                                total,
                                Some(fingerprint.bits()),
                            ))),
                            Some(Followup::Marking {
                                identity,
                                challenges,
                            }),
                        )
                    }
                    Err(e) => {
                        self.forget(&identity);
                        warn!(identity = %identity, "Marking round failed: {}", e);
                        (Response::error(e.to_string()), None)
                    }
                }
            }

            Request::GetAlts { identity } => {
                let alts = tracker
                    .correlator()
                    .alts_of(&identity)
                    .into_iter()
                    .map(Into::into)
                    .collect();
                (Response::Ok(ResponseData::alt_list(alts)), None)
            }

            Request::GetCanonical { identity } => {
                let canonical = tracker.correlator().canonical_of(&identity);
                (
                    Response::Ok(ResponseData::canonical(canonical.into_string())),
                    None,
                )
            }

            Request::FindByName { name } => {
                let identities = tracker
                    .index()
                    .find_by_name(&name)
                    .into_iter()
                    .map(IdentityId::into_string)
                    .collect();
                (Response::Ok(ResponseData::identity_list(identities)), None)
            }
        }
    }

    fn start_pacing(&mut self, identity: IdentityId, epoch: u64, challenges: Vec<Challenge>) {
        let task = tokio::spawn(pace_challenges(
            Arc::clone(&self.state.tracker),
            Arc::clone(&self.sink),
            identity.clone(),
            epoch,
            challenges,
            self.state.pacing,
        ));

        match self.sessions.get_mut(&identity) {
            Some(owned) if owned.epoch == epoch => owned.pacing = Some(task),
            _ => task.abort(),
        }
    }

    /// Stop tracking a session that completed
    fn forget(&mut self, identity: &IdentityId) {
        if let Some(mut owned) = self.sessions.remove(identity) {
            owned.stop_pacing();
        }
    }

    /// End every session started on this connection; returns how many were open
    fn close(&mut self) -> usize {
        let owned: Vec<(IdentityId, u64)> = self
            .sessions
            .drain()
            .map(|(identity, mut owned)| {
                owned.stop_pacing();
                (identity, owned.epoch)
            })
            .collect();
        self.state.tracker.end_sessions(owned)
    }
}

/// Run a tracker call that may rewrite the signature store on the blocking pool
async fn off_worker<T, F>(tracker: &Arc<Tracker>, f: F) -> cm_error::Result<T>
where
    F: FnOnce(&Tracker) -> cm_error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let tracker = Arc::clone(tracker);
    tokio::task::spawn_blocking(move || f(&tracker))
        .await
        .map_err(|e| CacheMarkError::generic(format!("Tracker task failed: {}", e)))?
}

fn ack(state: ProbeState, resolved: u32, total: u32, fingerprint: Option<u64>) -> ProbeAck {
    ProbeAck {
        state,
        resolved,
        total,
        fingerprint,
    }
}

/// Issue detection challenges one by one while the session stays current
async fn pace_challenges(
    tracker: Arc<Tracker>,
    sink: Arc<ConnectionSink>,
    identity: IdentityId,
    epoch: u64,
    challenges: Vec<Challenge>,
    pacing: Duration,
) {
    for (i, challenge) in challenges.iter().enumerate() {
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        if !tracker.is_current(&identity, epoch) {
            debug!(identity = %identity, epoch, "Session superseded, stopping challenges");
            return;
        }
        if let Err(e) = sink.issue_challenge(challenge) {
            debug!(identity = %identity, "Stopping challenges: {}", e);
            return;
        }
    }
    trace!(identity = %identity, issued = challenges.len(), "Detection round issued");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::{
        ContentStore, FingerprintGenerator, ManifestContentStore, ProbeAsset, SignatureIndex,
        TrackerOptions,
    };
    use cm_protocol::{ChallengeMessage, ProbeStatus};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::unix::OwnedReadHalf;

    fn state(n: usize) -> Arc<DaemonState> {
        let assets = (0..n)
            .map(|i| ProbeAsset {
                url: format!("http://cdn/{}", i),
                uuid: format!("probe-{}", i),
                digest: format!("d{}", i),
            })
            .collect();
        let tracker = Tracker::with_generator(
            Arc::new(ManifestContentStore::new(assets).unwrap()),
            Arc::new(SignatureIndex::in_memory(n).unwrap()),
            TrackerOptions::default(),
            FingerprintGenerator::with_seed(n, 7).unwrap(),
        )
        .unwrap();
        Arc::new(DaemonState::new(Arc::new(tracker), Duration::ZERO, 8))
    }

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
        next_id: u64,
    }

    impl TestClient {
        fn start(state: Arc<DaemonState>) -> (Self, JoinHandle<()>) {
            let (client, server) = UnixStream::pair().unwrap();
            let handle = tokio::spawn(handle_client(server, state));
            let (reader, writer) = client.into_split();
            (
                Self {
                    lines: BufReader::new(reader).lines(),
                    writer,
                    next_id: 1,
                },
                handle,
            )
        }

        async fn send(&mut self, request: Request) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            let mut json = serde_json::to_vec(&RequestEnvelope::with_id(request, id)).unwrap();
            json.push(b'\n');
            self.writer.write_all(&json).await.unwrap();
            id
        }

        async fn next(&mut self) -> Outbound {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn response(&mut self, id: u64) -> Response {
            match self.next().await {
                Outbound::Response(env) => {
                    assert_eq!(env.id, id);
                    env.response
                }
                Outbound::Challenge(c) => panic!("expected response, got challenge {:?}", c),
            }
        }

        async fn challenge(&mut self) -> ChallengeMessage {
            match self.next().await {
                Outbound::Challenge(c) => c,
                Outbound::Response(env) => panic!("expected challenge, got {:?}", env),
            }
        }

        async fn request(&mut self, request: Request) -> ResponseData {
            let id = self.send(request).await;
            match self.response(id).await {
                Response::Ok(data) => data,
                Response::Error { message } => panic!("unexpected error: {}", message),
            }
        }
    }

    /// Start a session and drain its detection challenges
    async fn open_session(client: &mut TestClient, identity: &str, probes: usize) {
        client.request(start(identity)).await;
        for _ in 0..probes {
            client.challenge().await;
        }
    }

    fn start(identity: &str) -> Request {
        Request::SessionStart {
            identity: identity.into(),
            display_name: identity.to_uppercase(),
        }
    }

    fn result(identity: &str, probe_id: u32, outcome: ProbeStatus) -> Request {
        Request::ProbeResult {
            identity: identity.into(),
            probe_id,
            outcome,
        }
    }

    #[tokio::test]
    async fn test_ping_and_version() {
        let (mut client, _) = TestClient::start(state(4));
        assert_eq!(client.request(Request::Ping).await.value.as_deref(), Some("pong"));
        assert_eq!(client.request(Request::Version).await.value.as_deref(), Some(VERSION));
    }

    /// Content store whose lookups can be made slow after detection
    struct SlowMarking {
        slow: std::sync::atomic::AtomicBool,
    }

    impl ContentStore for SlowMarking {
        fn probe_count(&self) -> usize {
            2
        }

        fn asset(&self, index: usize) -> cm_error::Result<ProbeAsset> {
            if self.slow.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            }
            Ok(ProbeAsset {
                url: format!("http://cdn/{}", index),
                uuid: format!("probe-{}", index),
                digest: format!("d{}", index),
            })
        }
    }

    #[tokio::test]
    async fn test_slow_marking_does_not_stall_other_connections() {
        let content = Arc::new(SlowMarking {
            slow: std::sync::atomic::AtomicBool::new(false),
        });
        let tracker = Tracker::with_generator(
            content.clone(),
            Arc::new(SignatureIndex::in_memory(2).unwrap()),
            TrackerOptions::default(),
            FingerprintGenerator::with_seed(2, 7).unwrap(),
        )
        .unwrap();
        let state = Arc::new(DaemonState::new(Arc::new(tracker), Duration::ZERO, 8));
        let (mut bridge, _) = TestClient::start(Arc::clone(&state));
        let (mut admin, _) = TestClient::start(state);

        open_session(&mut bridge, "p1", 2).await;
        bridge.request(result("p1", 0, ProbeStatus::Miss)).await;
        content.slow.store(true, Ordering::SeqCst);
        let last = bridge.send(result("p1", 1, ProbeStatus::Miss)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert_eq!(admin.request(Request::Ping).await.value.as_deref(), Some("pong"));
        assert!(started.elapsed() < Duration::from_millis(300));

        match bridge.response(last).await {
            Response::Ok(data) => assert_eq!(data.probe.unwrap().state, ProbeState::Marked),
            Response::Error { message } => panic!("unexpected error: {}", message),
        }
    }

    #[tokio::test]
    async fn test_unseen_device_flow() {
        let (mut client, _) = TestClient::start(state(4));

        let ack = client.request(start("p1")).await.probe.unwrap();
        assert_eq!(ack.state, ProbeState::Pending);
        assert_eq!(ack.total, 4);

        for i in 0..4 {
            let c = client.challenge().await;
            assert_eq!(c.probe_id, i);
            assert_eq!(c.url, cm_core::constants::probes::UNREACHABLE_URL);
            assert!(!c.force_refetch);
        }

        for i in 0..3 {
            let ack = client.request(result("p1", i, ProbeStatus::Miss)).await.probe.unwrap();
            assert_eq!(ack.state, ProbeState::Pending);
            assert_eq!(ack.resolved, i + 1);
        }

        let ack = client.request(result("p1", 3, ProbeStatus::Miss)).await.probe.unwrap();
        assert_eq!(ack.state, ProbeState::Marked);
        let value = ack.fingerprint.unwrap();
        assert_eq!(value.count_ones(), 2);

        let mut marked = 0u64;
        for _ in 0..2 {
            let c = client.challenge().await;
            assert!(c.force_refetch);
            assert_eq!(c.url, format!("http://cdn/{}", c.probe_id));
            marked |= 1 << c.probe_id;
        }
        assert_eq!(marked, value);
    }

    #[tokio::test]
    async fn test_returning_device_reports_alts() {
        let state = state(4);
        state.tracker().index().record_observation(
            &IdentityId::from("main"),
            "Main",
            cm_core::Fingerprint::from_bits(0b0110),
        );
        let (mut client, _) = TestClient::start(Arc::clone(&state));

        open_session(&mut client, "alt", 4).await;
        for (i, outcome) in [ProbeStatus::Miss, ProbeStatus::Hit, ProbeStatus::Hit, ProbeStatus::Miss]
            .into_iter()
            .enumerate()
        {
            client.request(result("alt", i as u32, outcome)).await;
        }

        let alts = client
            .request(Request::GetAlts { identity: "main".into() })
            .await
            .alts
            .unwrap();
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].identity, "alt");
        assert_eq!(alts[0].display_name, "ALT");

        let canonical = client
            .request(Request::GetCanonical { identity: "main".into() })
            .await
            .canonical;
        assert_eq!(canonical.as_deref(), Some("alt"));

        let found = client
            .request(Request::FindByName { name: "alt".into() })
            .await
            .identities
            .unwrap();
        assert_eq!(found, vec!["alt".to_string()]);
    }

    #[tokio::test]
    async fn test_late_result_is_ignored() {
        let (mut client, _) = TestClient::start(state(2));
        let ack = client.request(result("ghost", 0, ProbeStatus::Hit)).await.probe.unwrap();
        assert_eq!(ack.state, ProbeState::Ignored);
    }

    #[tokio::test]
    async fn test_invalid_requests_get_errors() {
        let (mut client, _) = TestClient::start(state(2));

        let id = client.send(start("bad identity")).await;
        assert!(matches!(client.response(id).await, Response::Error { .. }));

        client.writer.write_all(b"{not json}\n").await.unwrap();
        assert!(matches!(client.response(0).await, Response::Error { .. }));

        // Still usable afterwards
        assert!(client.request(Request::Ping).await.value.is_some());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_connection() {
        let (mut client, handle) = TestClient::start(state(2));
        let big = vec![b'x'; MAX_MESSAGE_SIZE + 10];
        client.writer.write_all(&big).await.unwrap();
        match client.response(0).await {
            Response::Error { message } => assert_eq!(message, "Message too large"),
            other => panic!("unexpected {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_close_ends_sessions() {
        let state = state(4);
        let (mut client, handle) = TestClient::start(Arc::clone(&state));
        open_session(&mut client, "p1", 4).await;
        client.request(result("p1", 0, ProbeStatus::Hit)).await;
        assert_eq!(state.tracker().active_sessions(), 1);

        drop(client);
        handle.await.unwrap();
        assert_eq!(state.tracker().active_sessions(), 0);
        assert!(state.tracker().index().record("p1").is_none());
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let state = state(4);
        let (mut client, _) = TestClient::start(Arc::clone(&state));
        open_session(&mut client, "p1", 4).await;
        let status = client.request(Request::Status).await.tracker.unwrap();
        assert_eq!(status.probe_count, 4);
        assert_eq!(status.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_bind_socket_replaces_stale_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cachemark.sock");
        std::fs::write(&path, "stale").unwrap();
        let _listener = bind_socket(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
    }

    #[tokio::test]
    async fn test_bind_socket_refuses_symlink() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, "").unwrap();
        let link = dir.path().join("cachemark.sock");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(bind_socket(&link).is_err());
        assert!(target.exists());
    }
}
