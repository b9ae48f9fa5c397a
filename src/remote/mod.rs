//! Persistent outbound session to the cluster controller
//!
//! Grounded line-for-line on `original_source/src/comm/comm_session.cpp`:
//! a reader thread blocks on the helper's `read()`, tries to enqueue into a
//! bounded inbound queue (dropping silently on overflow, matching the
//! original's `moodycamel::ReaderWriterQueue::try_enqueue`), then `ack()`s;
//! a writer thread drains an unbounded outbound queue and `write()`s,
//! sleeping briefly when idle. Both are literal OS threads, not tokio
//! tasks, per §5. An async dispatcher task bridges the inbound queue into
//! the `InstanceManager` and pushes responses back onto the outbound
//! queue.

mod hpws;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::InstanceManager;
use crate::message::{self, MessageCodec, Request};
use hpws::{HpwsReader, HpwsWriter};

const INBOUND_QUEUE_CAPACITY: usize = 64;
const WRITER_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Session lifecycle. Monotonic: a session never moves backwards, matching
/// `comm_session.hpp`'s `SESSION_STATE` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    None = 0,
    Active = 1,
    MustClose = 2,
    Closed = 3,
}

struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::None,
            1 => SessionState::Active,
            2 => SessionState::MustClose,
            _ => SessionState::Closed,
        }
    }

    /// Advances the state only if `next` is strictly ahead of the current
    /// state, enforcing the monotonic invariant.
    fn advance(&self, next: SessionState) {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if next as u8 <= current {
                return;
            }
            if self
                .0
                .compare_exchange(current, next as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }
}

pub struct RemoteSession {
    state: Arc<AtomicSessionState>,
    outbound_tx: Sender<Vec<u8>>,
}

impl RemoteSession {
    /// Spawns the helper process plus reader/writer threads and the async
    /// dispatcher, returning a handle used to enqueue outbound frames and
    /// observe/force session closure. `manager` is the serialized async
    /// `InstanceManager` every inbound request is dispatched to.
    pub fn start(
        hpws_exe: std::path::PathBuf,
        controller_url: String,
        manager: Arc<InstanceManager>,
        shutdown: CancellationToken,
    ) -> Result<Self, crate::error::AgentError> {
        let (reader, writer) = hpws::spawn(&hpws_exe, &controller_url)?;

        let state = Arc::new(AtomicSessionState::new(SessionState::None));
        let (inbound_tx, inbound_rx) = bounded::<Vec<u8>>(INBOUND_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = unbounded::<Vec<u8>>();

        // The unsolicited init message is sent synchronously before the
        // reader/writer loops start, matching comm_session.cpp's init().
        outbound_tx
            .send(MessageCodec::encode_value(&message::init_message()))
            .expect("outbound queue has a live receiver");

        state.advance(SessionState::Active);

        let reader_state = state.clone();
        std::thread::spawn(move || {
            crate::signal::block_sigpipe();
            reader_loop(reader, inbound_tx, reader_state);
        });

        let writer_state = state.clone();
        std::thread::spawn(move || {
            crate::signal::block_sigpipe();
            writer_loop(writer, outbound_rx, writer_state);
        });

        tokio::spawn(dispatch_loop(
            inbound_rx,
            outbound_tx.clone(),
            manager,
            state.clone(),
            shutdown,
        ));

        Ok(Self { state, outbound_tx })
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn request_close(&self) {
        self.state.advance(SessionState::MustClose);
    }

    /// Queue a frame for the writer thread. Silently dropped if the
    /// session has already moved to `Closed`.
    pub fn send(&self, bytes: Vec<u8>) {
        if self.state.load() == SessionState::Closed {
            return;
        }
        let _ = self.outbound_tx.send(bytes);
    }
}

fn reader_loop(mut helper: HpwsReader, inbound_tx: Sender<Vec<u8>>, state: Arc<AtomicSessionState>) {
    loop {
        if state.load() == SessionState::MustClose {
            break;
        }

        match helper.read() {
            Ok(Some(frame)) => {
                match inbound_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("inbound queue full, dropping frame");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
                if let Err(e) = helper.ack() {
                    warn!("failed to ack inbound frame: {}", e);
                }
            }
            Ok(None) => {
                debug!("hpws reported end-of-stream, closing session");
                break;
            }
            Err(e) => {
                warn!("hpws read error, closing session: {}", e);
                break;
            }
        }
    }

    helper.close();
    state.advance(SessionState::Closed);
}

fn writer_loop(writer: HpwsWriter, outbound_rx: Receiver<Vec<u8>>, state: Arc<AtomicSessionState>) {
    loop {
        match outbound_rx.try_recv() {
            Ok(frame) => {
                if let Err(e) = writer.write(&frame) {
                    warn!("hpws write error: {}", e);
                }
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {
                if state.load() == SessionState::Closed {
                    return;
                }
                std::thread::sleep(WRITER_IDLE_SLEEP);
            }
            Err(crossbeam_channel::TryRecvError::Disconnected) => return,
        }
    }
}

async fn dispatch_loop(
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    manager: Arc<InstanceManager>,
    state: Arc<AtomicSessionState>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() || state.load() == SessionState::Closed {
            return;
        }

        let inbound_rx = inbound_rx.clone();
        let recv_result =
            tokio::task::spawn_blocking(move || inbound_rx.recv_timeout(Duration::from_millis(200)))
                .await;

        let frame = match recv_result {
            Ok(Ok(frame)) => frame,
            Ok(Err(_timeout_or_disconnect)) => continue,
            Err(_join_error) => continue,
        };

        let response = match MessageCodec::decode_request(&frame) {
            Ok(request) => handle_request(&manager, request).await,
            Err(e) => MessageCodec::encode_value(&message::generic_error(&e)),
        };

        if outbound_tx.send(response).is_err() {
            warn!("outbound queue closed, stopping dispatcher");
            return;
        }
    }
}

async fn handle_request(manager: &InstanceManager, request: Request) -> Vec<u8> {
    let type_name = request.type_name();
    let result: Result<serde_json::Value, crate::error::AgentError> = async {
        match request {
            Request::List => Ok(message::list_res(&manager.list().await?)),
            Request::Inspect { container_name } => {
                Ok(message::inspect_res(&manager.inspect(&container_name).await?))
            }
            Request::Destroy { container_name } => {
                manager.destroy(&container_name).await?;
                Ok(message::message_res(
                    "destroy_res",
                    &format!("Instance {container_name} destroyed."),
                ))
            }
            Request::Start { container_name } => {
                manager.start(&container_name).await?;
                Ok(message::message_res(
                    "start_res",
                    &format!("Instance {container_name} started."),
                ))
            }
            Request::Stop { container_name } => {
                manager.stop(&container_name).await?;
                Ok(message::message_res(
                    "stop_res",
                    &format!("Instance {container_name} stopped."),
                ))
            }
            Request::Initiate {
                container_name,
                config,
            } => {
                manager.initiate(&container_name, config).await?;
                Ok(message::message_res(
                    "initiate_res",
                    &format!("Instance {container_name} initiated."),
                ))
            }
            Request::Create {
                owner_pubkey,
                contract_id,
                image,
            } => {
                let record = manager
                    .create(crate::manager::CreateRequest {
                        owner_pubkey,
                        contract_id,
                        image,
                    })
                    .await?;
                Ok(message::create_res(&record))
            }
        }
    }
    .await;

    match result {
        Ok(value) => MessageCodec::encode_value(&value),
        Err(e) => {
            info!("remote request {} failed: {}", type_name, e);
            MessageCodec::encode_request_error(type_name, &e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_is_monotonic() {
        let state = AtomicSessionState::new(SessionState::None);
        state.advance(SessionState::Active);
        assert_eq!(state.load(), SessionState::Active);

        state.advance(SessionState::None); // attempt to go backwards
        assert_eq!(state.load(), SessionState::Active);

        state.advance(SessionState::Closed);
        assert_eq!(state.load(), SessionState::Closed);

        state.advance(SessionState::MustClose); // attempt to go backwards
        assert_eq!(state.load(), SessionState::Closed);
    }
}
