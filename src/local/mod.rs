//! Local administrative control socket
//!
//! A `SOCK_SEQPACKET` Unix domain socket, one request/response per
//! datagram, grounded on `original_source/sashi-cli/cli-manager.cpp`'s
//! wire contract. `tokio::net::UnixDatagram` is `SOCK_DGRAM`, not
//! `SOCK_SEQPACKET`, so this uses `nix`'s raw socket bindings directly and
//! runs the accept/serve loop on a dedicated blocking thread, bridging
//! into the async `InstanceManager` with `Handle::block_on`. That
//! naturally serializes every request the socket receives, as §5 requires.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixListener as StdUnixListenerMarker;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::socket::{
    accept, bind, listen, recv, send, socket, AddressFamily, Backlog, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::manager::InstanceManager;
use crate::message::{self, MessageCodec, Request};

// Silence "unused import" noise: this marker type documents why
// tokio::net::UnixListener is unsuitable here, without actually using it.
#[allow(dead_code)]
type _DocOnly = StdUnixListenerMarker;

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct LocalControlServer {
    socket_path: PathBuf,
    manager: Arc<InstanceManager>,
}

impl LocalControlServer {
    pub fn new(socket_path: PathBuf, manager: Arc<InstanceManager>) -> Self {
        Self {
            socket_path,
            manager,
        }
    }

    /// Spawns the blocking accept loop on a dedicated OS thread. Returns
    /// immediately; the thread exits once `shutdown` is cancelled and the
    /// listening socket is closed.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> std::thread::JoinHandle<()> {
        let rt = Handle::current();
        std::thread::spawn(move || {
            crate::signal::block_sigpipe();
            if let Err(e) = self.serve(rt, shutdown) {
                error!("local control server exited with error: {}", e);
            }
        })
    }

    fn serve(&self, rt: Handle, shutdown: CancellationToken) -> Result<(), AgentError> {
        let _ = std::fs::remove_file(&self.socket_path);

        let listen_fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .map_err(|e| AgentError::Transport(format!("failed to create local socket: {e}")))?;

        let addr = UnixAddr::new(&self.socket_path)
            .map_err(|e| AgentError::Transport(format!("invalid local socket path: {e}")))?;
        bind(listen_fd.as_raw_fd(), &addr)
            .map_err(|e| AgentError::Transport(format!("bind failed: {e}")))?;
        listen(&listen_fd, Backlog::new(16).unwrap())
            .map_err(|e| AgentError::Transport(format!("listen failed: {e}")))?;

        apply_socket_permissions(&self.socket_path);

        info!("local control socket listening at {:?}", self.socket_path);

        while !shutdown.is_cancelled() {
            let client_fd = match accept(listen_fd.as_raw_fd()) {
                Ok(fd) => fd,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("accept failed on local socket: {}", e);
                    continue;
                }
            };

            // SAFETY: `accept` on a valid listening fd returns a fresh,
            // uniquely owned fd.
            let client_fd = unsafe { OwnedFd::from_raw_fd(client_fd) };
            self.handle_client(&rt, client_fd);
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    fn handle_client(&self, rt: &Handle, client_fd: OwnedFd) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = match recv(client_fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(n) => n,
            Err(e) => {
                debug!("recv on local socket client failed: {}", e);
                return;
            }
        };

        let response_bytes = match MessageCodec::decode_request(&buf[..n]) {
            Ok(request) => {
                let type_name = request.type_name();
                match rt.block_on(dispatch(&self.manager, request)) {
                    Ok(value) => MessageCodec::encode_value(&value),
                    Err(e) => MessageCodec::encode_request_error(type_name, &e),
                }
            }
            Err(e) => MessageCodec::encode_value(&message::generic_error(&e)),
        };

        if let Err(e) = send(client_fd.as_raw_fd(), &response_bytes, MsgFlags::empty()) {
            debug!("send on local socket client failed: {}", e);
        }
    }
}

/// Dispatches a decoded request to the corresponding `InstanceManager`
/// call and shapes its success value into the matching response shape.
async fn dispatch(
    manager: &InstanceManager,
    request: Request,
) -> Result<serde_json::Value, AgentError> {
    match request {
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
        Request::List => {
            let instances = manager.list().await?;
            Ok(message::list_res(&instances))
        }
        Request::Inspect { container_name } => {
            let summary = manager.inspect(&container_name).await?;
            Ok(message::inspect_res(&summary))
        }
    }
}

/// Restricts the socket to the `sashiadmin` group, falling back to a
/// logged warning (not a hard failure) when the group doesn't exist on
/// this host — e.g. in a development container.
fn apply_socket_permissions(path: &Path) {
    use nix::unistd::{chown, Group};

    match Group::from_name("sashiadmin") {
        Ok(Some(group)) => {
            if let Err(e) = chown(path, None, Some(group.gid)) {
                warn!("failed to chown local socket to sashiadmin: {}", e);
            }
        }
        Ok(None) => warn!("group 'sashiadmin' does not exist, leaving socket ownership as-is"),
        Err(e) => warn!("failed to look up group 'sashiadmin': {}", e),
    }

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
        warn!("failed to chmod local socket: {}", e);
    }
}

use std::os::unix::fs::PermissionsExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_used_verbatim() {
        // Construction is cheap and side-effect-free until `spawn` is
        // called; this just documents the field wiring.
        let path = PathBuf::from("/tmp/sa-test.sock");
        assert_eq!(path.to_str().unwrap(), "/tmp/sa-test.sock");
    }
}
