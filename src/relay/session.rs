use std::{io, sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use tracing::{info, warn};

use crate::{
    core::frame::Frame,
    relay::encode::MultipartEncoder,
    shared::{
        role::{RoleLock, WriterGuard},
        slot::{ReadOutcome, SharedSlot},
    },
    upstream::{connector::UpstreamBackend, extract::FrameStream},
};

const WRITER_FRAME_PAUSE: Duration = Duration::from_millis(100);
const READER_FRESH_PAUSE: Duration = Duration::from_millis(100);
const READER_RETRY_PAUSE: Duration = Duration::from_millis(250);
const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const UPSTREAM_RETRY_PAUSE: Duration = Duration::from_secs(1);
const RECOVERY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a writer tenure ended.
enum Tenure {
    ClientGone,
    UpstreamLost,
    BudgetExhausted,
}

/// One client-serving relay participant.
///
/// Every session contends for the writer role; the winner owns the single
/// upstream connection and feeds the shared slot, everyone else serves
/// frames out of the slot. Election is re-attempted on every loop
/// iteration, so a dead writer is replaced by the first reader to notice
/// the freed token.
pub struct RelaySession {
    upstream: Arc<dyn UpstreamBackend>,
    slot: SharedSlot,
    role: RoleLock,
    encoder: MultipartEncoder,
    client: mpsc::Sender<Result<Bytes, io::Error>>,
    boundary_in: Option<String>,
    max_frame_age: Duration,
    deadline: Instant,
    last_seen: Option<u64>,
}

impl RelaySession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<dyn UpstreamBackend>,
        slot: SharedSlot,
        role: RoleLock,
        encoder: MultipartEncoder,
        client: mpsc::Sender<Result<Bytes, io::Error>>,
        boundary_in: Option<String>,
        max_frame_age: Duration,
        time_limit: Duration,
    ) -> Self {
        Self {
            upstream,
            slot,
            role,
            encoder,
            client,
            boundary_in,
            max_frame_age,
            deadline: Instant::now() + time_limit,
            last_seen: None,
        }
    }

    /// Serve the client until it disconnects or the execution budget runs
    /// out. Returning drops the writer guard if one is held, which is the
    /// token release other sessions are waiting on.
    pub async fn run(mut self) {
        let preamble = self.encoder.preamble();
        if !self.send(preamble).await {
            return;
        }

        loop {
            if Instant::now() >= self.deadline {
                info!("stream time budget exhausted, closing session");
                return;
            }

            match self.role.try_acquire() {
                Ok(Some(guard)) => match self.serve_as_writer(guard).await {
                    Tenure::ClientGone => {
                        info!("client disconnected, releasing writer role");
                        return;
                    }
                    Tenure::BudgetExhausted => {
                        info!("stream time budget exhausted during writer tenure");
                        return;
                    }
                    // Reconnection happens on a later election cycle, not
                    // in a tight loop.
                    Tenure::UpstreamLost => sleep(UPSTREAM_RETRY_PAUSE).await,
                },
                Ok(None) => {
                    if !self.serve_as_reader().await {
                        info!("client disconnected, closing reader session");
                        return;
                    }
                }
                Err(err) => {
                    warn!("writer election failed: {err}");
                    return;
                }
            }
        }
    }

    async fn serve_as_writer(&mut self, guard: WriterGuard) -> Tenure {
        // The guard lives exactly as long as this tenure.
        let _role = guard;
        info!("elected writer");

        let source = match self.upstream.open().await {
            Ok(source) => source,
            Err(err) => {
                warn!("upstream connect failed: {err}");
                return Tenure::UpstreamLost;
            }
        };
        let mut frames = FrameStream::new(source, self.boundary_in.as_deref());

        loop {
            if Instant::now() >= self.deadline {
                return Tenure::BudgetExhausted;
            }

            match frames.next_frame().await {
                Ok(Some(frame)) => {
                    if let Err(err) = self.slot.write(&frame).await {
                        warn!("shared slot write failed: {err}");
                    }
                    self.last_seen = Some(frame.timestamp_us);

                    let part = self.encoder.part(&frame);
                    if !self.send(part).await {
                        return Tenure::ClientGone;
                    }
                    sleep(WRITER_FRAME_PAUSE).await;
                }
                Ok(None) => {
                    info!("upstream stream exhausted");
                    return Tenure::UpstreamLost;
                }
                Err(err) => {
                    warn!("upstream read failed: {err}");
                    return Tenure::UpstreamLost;
                }
            }
        }
    }

    /// One reader iteration. Returns false once the client is gone.
    async fn serve_as_reader(&mut self) -> bool {
        match self
            .slot
            .read(self.last_seen, self.max_frame_age, READ_LOCK_TIMEOUT)
            .await
        {
            Ok(ReadOutcome::Fresh(frame)) => {
                self.last_seen = Some(frame.timestamp_us);
                let part = self.encoder.part(&frame);
                if !self.send(part).await {
                    return false;
                }
                sleep(READER_FRESH_PAUSE).await;
                true
            }
            Ok(ReadOutcome::Unchanged) => {
                sleep(READER_RETRY_PAUSE).await;
                true
            }
            // Election already failed this iteration, so a writer is
            // nominally alive but not producing: degraded self-recovery.
            Ok(ReadOutcome::Stale) => self.recover_directly().await,
            Err(err) => {
                warn!("shared slot read failed: {err}");
                sleep(READER_RETRY_PAUSE).await;
                true
            }
        }
    }

    /// Fetch a single frame straight from the camera to keep this client
    /// alive. The slot write happens without the writer token; the slot is
    /// latest-wins, so concurrent writes stay coherent per frame.
    async fn recover_directly(&mut self) -> bool {
        warn!("no fresh frame from the current writer, fetching one directly");

        let frame = match timeout(RECOVERY_FETCH_TIMEOUT, self.fetch_one_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                warn!("upstream closed before delivering a recovery frame");
                sleep(READER_RETRY_PAUSE).await;
                return true;
            }
            Ok(Err(err)) => {
                warn!("direct upstream fetch failed: {err}");
                sleep(UPSTREAM_RETRY_PAUSE).await;
                return true;
            }
            Err(_) => {
                warn!("direct upstream fetch timed out");
                return true;
            }
        };

        if let Err(err) = self.slot.write(&frame).await {
            warn!("shared slot write failed during recovery: {err}");
        }
        self.last_seen = Some(frame.timestamp_us);
        let part = self.encoder.part(&frame);
        self.send(part).await
    }

    async fn fetch_one_frame(&self) -> Result<Option<Frame>> {
        let source = self.upstream.open().await?;
        FrameStream::new(source, self.boundary_in.as_deref())
            .next_frame()
            .await
    }

    /// A failed send means the response body was dropped: the client
    /// disconnected. That is the only cancellation signal besides the
    /// time budget.
    async fn send(&self, part: Bytes) -> bool {
        self.client.send(Ok(part)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        path::PathBuf,
        sync::Arc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::{
        core::frame::{Frame, now_micros},
        relay::encode::MultipartEncoder,
        shared::{
            role::RoleLock,
            slot::{ReadOutcome, SharedSlot},
        },
        upstream::connector::{ByteSource, UpstreamBackend},
    };

    use super::RelaySession;

    const SLOT_CAPACITY: usize = 1024 * 1024;

    struct MockUpstream {
        payload: Vec<u8>,
    }

    impl MockUpstream {
        fn with_bodies(bodies: &[&[u8]]) -> Self {
            let mut payload = b"HTTP/1.1 200 OK\r\n\
                Content-Type: multipart/x-mixed-replace; boundary=mock\r\n\r\n"
                .to_vec();
            for body in bodies {
                payload.extend_from_slice(b"--mock\r\nContent-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(body);
                payload.extend_from_slice(b"\r\n");
            }
            payload.extend_from_slice(b"--mock\r\n");
            Self { payload }
        }
    }

    #[async_trait]
    impl UpstreamBackend for MockUpstream {
        async fn open(&self) -> Result<ByteSource> {
            Ok(Box::new(Cursor::new(self.payload.clone())))
        }
    }

    fn temp_dir(label: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("restreamer-session-{label}-{suffix}"))
    }

    fn session_for(
        dir: &PathBuf,
        upstream: Arc<dyn UpstreamBackend>,
        client: mpsc::Sender<Result<Bytes, std::io::Error>>,
        time_limit: Duration,
    ) -> RelaySession {
        let slot = SharedSlot::open(dir, "cam", SLOT_CAPACITY).expect("slot should open");
        let role = RoleLock::open(dir, "cam").expect("role lock should open");
        RelaySession::new(
            upstream,
            slot,
            role,
            MultipartEncoder::new("outbound"),
            client,
            None,
            Duration::from_secs(60),
            time_limit,
        )
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle)
    }

    async fn collect(rx: &mut mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Vec<Bytes> {
        let mut parts = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            parts.push(item.expect("stream items should be ok"));
        }
        parts
    }

    #[tokio::test]
    async fn writer_serves_client_and_fills_the_slot() {
        let dir = temp_dir("writer");
        let first = vec![0xAB_u8; 150];
        let second = vec![0xCD_u8; 150];
        let upstream = Arc::new(MockUpstream::with_bodies(&[&first, &second]));

        let (tx, mut rx) = mpsc::channel(16);
        let session = session_for(&dir, upstream, tx, Duration::from_millis(700));
        session.run().await;

        let parts = collect(&mut rx).await;
        assert_eq!(parts[0].as_ref(), b"--outbound\r\n");
        assert!(contains(&parts[1], &first));
        assert!(contains(&parts[2], &second));

        let slot = SharedSlot::open(&dir, "cam", SLOT_CAPACITY).expect("slot should reopen");
        let outcome = slot
            .read(None, Duration::from_secs(60), Duration::from_millis(100))
            .await
            .expect("read should succeed");
        let ReadOutcome::Fresh(frame) = outcome else {
            panic!("slot should hold the last written frame, got {outcome:?}");
        };
        assert_eq!(frame.data, second);
    }

    #[tokio::test]
    async fn writer_token_is_free_after_the_session_ends() {
        let dir = temp_dir("release");
        let upstream = Arc::new(MockUpstream::with_bodies(&[&[0xAA_u8; 150][..]]));

        let (tx, rx) = mpsc::channel(16);
        // Dropping the receiver first makes the very first send fail,
        // ending the session as a client disconnect.
        drop(rx);
        let session = session_for(&dir, upstream, tx, Duration::from_secs(5));
        session.run().await;

        let role = RoleLock::open(&dir, "cam").expect("role lock should open");
        let guard = role.try_acquire().expect("acquire should not error");
        assert!(guard.is_some(), "token must be free once the session ended");
    }

    #[tokio::test]
    async fn reader_serves_slot_frames_then_promotes_when_the_token_frees() {
        let dir = temp_dir("promote");
        let slot_payload = vec![0x5A_u8; 150];
        let upstream_payload = vec![0xB7_u8; 150];

        let mut seed = SharedSlot::open(&dir, "cam", SLOT_CAPACITY).expect("slot should open");
        seed.write(&Frame {
            data: Bytes::from(slot_payload.clone()),
            timestamp_us: now_micros(),
        })
        .await
        .expect("seed write should succeed");

        let blocker = RoleLock::open(&dir, "cam").expect("role lock should open");
        let held = blocker
            .try_acquire()
            .expect("acquire should not error")
            .expect("blocker should take the token first");

        let upstream = Arc::new(MockUpstream::with_bodies(&[&upstream_payload]));
        let (tx, mut rx) = mpsc::channel(32);
        let session = session_for(&dir, upstream, tx, Duration::from_secs(10));
        let worker = tokio::spawn(session.run());

        let preamble = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("preamble should arrive")
            .expect("stream should be open")
            .expect("stream items should be ok");
        assert_eq!(preamble.as_ref(), b"--outbound\r\n");

        let from_slot = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("slot frame should arrive while the token is held")
            .expect("stream should be open")
            .expect("stream items should be ok");
        assert!(contains(&from_slot, &slot_payload));

        // Simulate the writer process dying: the kernel would drop its
        // flock exactly like this drop does.
        drop(held);

        let mut promoted = false;
        for _ in 0..20 {
            let Ok(Some(Ok(part))) =
                tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
            else {
                break;
            };
            if contains(&part, &upstream_payload) {
                promoted = true;
                break;
            }
        }
        assert!(promoted, "reader should take over the writer role");

        worker.abort();
    }

    #[tokio::test]
    async fn stale_reader_recovers_directly_from_upstream() {
        let dir = temp_dir("recover");
        let payload = vec![0xE1_u8; 150];

        let blocker = RoleLock::open(&dir, "cam").expect("role lock should open");
        let _held = blocker
            .try_acquire()
            .expect("acquire should not error")
            .expect("blocker should take the token first");

        let upstream = Arc::new(MockUpstream::with_bodies(&[&payload]));
        let (tx, mut rx) = mpsc::channel(32);
        let session = session_for(&dir, upstream, tx, Duration::from_secs(10));
        let worker = tokio::spawn(session.run());

        let mut recovered = false;
        for _ in 0..5 {
            let Ok(Some(Ok(part))) =
                tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
            else {
                break;
            };
            if contains(&part, &payload) {
                recovered = true;
                break;
            }
        }
        assert!(
            recovered,
            "a stale slot with a held token must trigger a direct fetch"
        );

        // The degraded fetch also refreshed the slot for other readers.
        let slot = SharedSlot::open(&dir, "cam", SLOT_CAPACITY).expect("slot should reopen");
        let outcome = slot
            .read(None, Duration::from_secs(60), Duration::from_millis(100))
            .await
            .expect("read should succeed");
        assert!(matches!(outcome, ReadOutcome::Fresh(_)));

        worker.abort();
    }
}
