//! TCP client output: one outbound connection, one reader thread.
//!
//! When the remote end closes, the output marks itself stopped and stays
//! stopped until someone starts it again.

use super::{
    CONNECT_TIMEOUT, ChannelContext, JOIN_TIMEOUT, OutputChannel, SOCKET_READ_TIMEOUT,
    SOCKET_WRITE_TIMEOUT, is_timeout, join_bounded, resolve,
};
use crate::error::{Error, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

struct Shared {
    ctx: ChannelContext,
    running: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

pub struct TcpClientOutput {
    remote: String,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClientOutput {
    pub fn new(remote: String, ctx: ChannelContext) -> Self {
        Self {
            remote,
            shared: Arc::new(Shared {
                ctx,
                running: AtomicBool::new(false),
                stream: Mutex::new(None),
            }),
            reader: Mutex::new(None),
        }
    }

    fn read_loop(shared: Arc<Shared>, mut stream: TcpStream, remote: SocketAddr) {
        let mut buf = [0u8; 4096];
        let mut closed_by_remote = false;
        while shared.running.load(Ordering::Relaxed) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    closed_by_remote = true;
                    break;
                }
                Ok(n) => shared.ctx.deliver(&buf[..n]),
                Err(ref e) if is_timeout(e) => {}
                Err(e) => {
                    debug!("[{}] Read error from {}: {}", shared.ctx.id, remote, e);
                    closed_by_remote = true;
                    break;
                }
            }
        }

        // A remote close stops the output; stop() handles its own teardown
        if closed_by_remote && shared.running.swap(false, Ordering::SeqCst) {
            if let Some(s) = shared.stream.lock().take() {
                let _ = s.shutdown(Shutdown::Both);
            }
            warn!("[{}] Connection to {} closed by remote", shared.ctx.id, remote);
            shared.ctx.changed();
        }
    }
}

impl OutputChannel for TcpClientOutput {
    fn start(&self) -> Result<String> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.shared.ctx.id.clone()));
        }

        // A reader left over from a remote close has exited or is about to
        if let Some(old) = self.reader.lock().take() {
            join_bounded(vec![old], JOIN_TIMEOUT, &self.shared.ctx.id);
        }

        let remote = resolve(&self.remote)?;
        let stream = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT)
            .map_err(|e| Error::from_socket(e, &self.remote))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_WRITE_TIMEOUT))?;
        let reader = stream.try_clone()?;

        *self.shared.stream.lock() = Some(stream);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-reader", self.shared.ctx.id))
            .spawn(move || Self::read_loop(shared, reader, remote));
        match spawned {
            Ok(handle) => *self.reader.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.stream.lock().take();
                return Err(e.into());
            }
        }

        info!("[{}] Connected to {}", self.shared.ctx.id, remote);
        Ok(format!("Connected to {}", remote))
    }

    fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if let Some(s) = self.shared.stream.lock().take() {
            let _ = s.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().take() {
            join_bounded(vec![handle], JOIN_TIMEOUT, &self.shared.ctx.id);
        }
        if was_running {
            info!("[{}] TCP client stopped", self.shared.ctx.id);
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        let mut guard = self.shared.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::NotRunning(self.shared.ctx.id.clone()))?;
        stream.write_all(data)?;
        Ok(1)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn peers(&self) -> usize {
        usize::from(self.shared.stream.lock().is_some())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .stream
            .lock()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }
}

impl Drop for TcpClientOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterHooks;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn client(remote: String) -> TcpClientOutput {
        let ctx = ChannelContext::new("cli", Arc::default(), Arc::new(RouterHooks::default()));
        TcpClientOutput::new(remote, ctx)
    }

    #[test]
    fn test_connect_send_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let out = client(listener.local_addr().unwrap().to_string());

        let msg = out.start().unwrap();
        assert!(msg.starts_with("Connected to"));
        let (mut peer, _) = listener.accept().unwrap();

        out.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(2);
        while out.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!out.is_running());
        assert!(matches!(out.send(b"x"), Err(Error::NotRunning(_))));
    }

    #[test]
    fn test_refused_connection_is_classified() {
        // Grab a free port, then close the listener so nothing answers there
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let out = client(format!("127.0.0.1:{}", port));
        assert!(matches!(out.start(), Err(Error::ConnectionRefused(_))));
        assert!(!out.is_running());
    }
}
