//! TCP accept loop and per-client fan-out registry, per spec.md §5/§6.1.
//!
//! Grounded on the donor's `network/server_actor.rs` overall shape
//! (accept loop, per-connection handler) translated from
//! `tokio::net::TcpListener`/`tokio::spawn` to blocking
//! `std::net::TcpListener::accept()` + `std::thread::spawn`, per
//! spec.md §5's no-async-runtime requirement.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::error::DaqResult;

/// A registry of connected clients' write-halves, shared with the
/// Fuser so it can fan a record out to all of them.
pub type ClientRegistry = Arc<Mutex<Vec<Arc<Mutex<TcpStream>>>>>;

/// Owns the accept loop thread. One Client-Service thread is spawned
/// per accepted connection (spec.md §5's thread list); since this
/// protocol is server-push-only (the server never reads from a
/// client), the per-connection thread's only job is to detect when the
/// peer has gone away and deregister it.
pub struct Server {
    clients: ClientRegistry,
    accept_handle: Option<JoinHandle<()>>,
    exiting: Arc<AtomicBool>,
}

impl Server {
    /// Binds `listen_addr` and spawns the accept loop.
    pub fn start(listen_addr: &str) -> DaqResult<Self> {
        let listener = TcpListener::bind(listen_addr)?;
        info!(listen_addr, "server listening");
        let clients: ClientRegistry = Arc::new(Mutex::new(Vec::new()));
        let exiting = Arc::new(AtomicBool::new(false));

        let accept_clients = Arc::clone(&clients);
        let accept_exiting = Arc::clone(&exiting);
        // A short accept timeout lets the loop observe `exiting`
        // without blocking forever in `accept()`.
        listener.set_nonblocking(true)?;
        let accept_handle = std::thread::spawn(move || {
            Self::accept_loop(listener, accept_clients, accept_exiting);
        });

        Ok(Server {
            clients,
            accept_handle: Some(accept_handle),
            exiting,
        })
    }

    fn accept_loop(listener: TcpListener, clients: ClientRegistry, exiting: Arc<AtomicBool>) {
        loop {
            if exiting.load(Ordering::Acquire) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected");
                    stream.set_nodelay(true).ok();
                    let handle = Arc::new(Mutex::new(stream));
                    clients
                        .lock()
                        .expect("client registry mutex poisoned")
                        .push(Arc::clone(&handle));
                    let service_clients = Arc::clone(&clients);
                    let service_exiting = Arc::clone(&exiting);
                    std::thread::spawn(move || {
                        Self::service_client(handle, service_clients, service_exiting, peer);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "accept() failed");
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
        }
    }

    /// Watches one connection for the peer going away (a failed write
    /// from the Fuser's fan-out, or a zero-length read here), then
    /// deregisters it. The server never expects application data from
    /// the client; any bytes received are discarded.
    fn service_client(
        handle: Arc<Mutex<TcpStream>>,
        clients: ClientRegistry,
        exiting: Arc<AtomicBool>,
        peer: std::net::SocketAddr,
    ) {
        use std::io::Read;
        let mut scratch = [0u8; 64];
        loop {
            if exiting.load(Ordering::Acquire) {
                break;
            }
            let readable = {
                let mut stream = handle.lock().expect("client stream mutex poisoned");
                stream
                    .set_read_timeout(Some(std::time::Duration::from_millis(500)))
                    .ok();
                stream.read(&mut scratch)
            };
            match readable {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => break,
            }
        }
        info!(%peer, "client disconnected");
        clients
            .lock()
            .expect("client registry mutex poisoned")
            .retain(|c| !Arc::ptr_eq(c, &handle));
    }

    /// Shared registry for the Fuser's fan-out.
    pub fn clients(&self) -> ClientRegistry {
        Arc::clone(&self.clients)
    }

    /// Requests the accept loop to stop and joins it, per the 5 s join
    /// budget of spec.md §5.
    pub fn stop(&mut self) {
        self.exiting.store(true, Ordering::Release);
        if let Some(h) = self.accept_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as ClientStream;

    #[test]
    fn accepts_connection_and_registers_client() {
        let mut server = Server::start("127.0.0.1:19321").unwrap();
        let _client = ClientStream::connect("127.0.0.1:19321").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(server.clients().lock().unwrap().len(), 1);
        server.stop();
    }
}
