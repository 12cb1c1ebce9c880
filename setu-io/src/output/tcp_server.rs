//! TCP server output: listens, accepts any number of clients, fans frames
//! out to all of them and relays whatever they send back.
//!
//! Each client gets a reader thread and a writer thread. `send` only queues
//! the frame on every client's bounded queue, so a stalled client never
//! delays the others; one whose queue is full is disconnected.

use super::{
    ChannelContext, JOIN_TIMEOUT, OutputChannel, SOCKET_READ_TIMEOUT, SOCKET_WRITE_TIMEOUT,
    is_timeout, join_bounded,
};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Frames queued per client before it counts as stalled
pub const CLIENT_QUEUE_DEPTH: usize = 256;

struct Client {
    addr: SocketAddr,
    stream: TcpStream,
    queue: Sender<Arc<[u8]>>,
}

impl Client {
    fn disconnect(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// State shared with the accept, reader and writer threads
struct Shared {
    ctx: ChannelContext,
    running: AtomicBool,
    clients: Mutex<Vec<Client>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Drop a client; returns true if it was still registered
    fn remove_client(&self, addr: SocketAddr) -> bool {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|c| {
            if c.addr == addr {
                c.disconnect();
                false
            } else {
                true
            }
        });
        clients.len() != before
    }

    /// Join threads of clients that already left
    fn reap_finished(&self) {
        let mut threads = self.threads.lock();
        let (done, live): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *threads).into_iter().partition(|h| h.is_finished());
        *threads = live;
        drop(threads);
        for handle in done {
            if handle.join().is_err() {
                warn!("[{}] client thread panicked", self.ctx.id);
            }
        }
    }

    /// Client departure seen by its reader or writer
    fn client_left(&self, addr: SocketAddr) {
        // stop() clears the client list itself; only report departures
        // that happen while the server keeps running
        if self.remove_client(addr) {
            info!("[{}] Client disconnected: {}", self.ctx.id, addr);
            self.ctx.changed();
        }
    }
}

pub struct TcpServerOutput {
    bind_address: String,
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServerOutput {
    pub fn new(bind_address: String, ctx: ChannelContext) -> Self {
        Self {
            bind_address,
            shared: Arc::new(Shared {
                ctx,
                running: AtomicBool::new(false),
                clients: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
            }),
            local_addr: Mutex::new(None),
        }
    }

    fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
        while shared.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = Self::admit(&shared, stream, addr) {
                        warn!("[{}] Failed to admit client {}: {}", shared.ctx.id, addr, e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    error!("[{}] Accept error: {}", shared.ctx.id, e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!("[{}] Accept loop exiting", shared.ctx.id);
    }

    fn admit(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> std::io::Result<()> {
        shared.reap_finished();

        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_WRITE_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let (queue, frames) = bounded(CLIENT_QUEUE_DEPTH);

        {
            // stop() drains the list under this lock; a client registered
            // after that would never be shut down
            let mut clients = shared.clients.lock();
            if !shared.running.load(Ordering::SeqCst) {
                let _ = stream.shutdown(Shutdown::Both);
                debug!("[{}] Refused {} while stopping", shared.ctx.id, addr);
                return Ok(());
            }

            let reader_shared = Arc::clone(shared);
            let reader_handle = thread::Builder::new()
                .name(format!("{}-client-rx", shared.ctx.id))
                .spawn(move || Self::client_loop(reader_shared, reader, addr))?;
            let writer_shared = Arc::clone(shared);
            let writer_handle = thread::Builder::new()
                .name(format!("{}-client-tx", shared.ctx.id))
                .spawn(move || Self::writer_loop(writer_shared, writer, addr, frames));

            clients.push(Client {
                addr,
                stream,
                queue,
            });
            let mut threads = shared.threads.lock();
            threads.push(reader_handle);
            match writer_handle {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // The reader sees the shutdown and removes the entry
                    if let Some(client) = clients.last() {
                        client.disconnect();
                    }
                    return Err(e);
                }
            }
        }

        info!("[{}] Client connected: {}", shared.ctx.id, addr);
        shared.ctx.changed();
        Ok(())
    }

    fn client_loop(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
        let mut buf = [0u8; 4096];
        while shared.running.load(Ordering::Relaxed) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!("[{}] Client {} closed connection", shared.ctx.id, addr);
                    break;
                }
                Ok(n) => shared.ctx.deliver(&buf[..n]),
                Err(ref e) if is_timeout(e) => {}
                Err(e) => {
                    debug!("[{}] Client {} read error: {}", shared.ctx.id, addr, e);
                    break;
                }
            }
        }
        shared.client_left(addr);
    }

    /// Drains one client's queue; ends when the client is removed or a write fails
    fn writer_loop(
        shared: Arc<Shared>,
        mut stream: TcpStream,
        addr: SocketAddr,
        frames: Receiver<Arc<[u8]>>,
    ) {
        for frame in frames.iter() {
            if let Err(e) = stream.write_all(&frame) {
                debug!("[{}] Client {} write error: {}", shared.ctx.id, addr, e);
                shared.client_left(addr);
                break;
            }
        }
    }
}

impl OutputChannel for TcpServerOutput {
    fn start(&self) -> Result<String> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.shared.ctx.id.clone()));
        }

        let listener = TcpListener::bind(&self.bind_address)
            .map_err(|e| Error::from_socket(e, &self.bind_address))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-accept", self.shared.ctx.id))
            .spawn(move || Self::accept_loop(shared, listener));
        match spawned {
            Ok(handle) => self.shared.threads.lock().push(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        *self.local_addr.lock() = Some(local);
        info!("[{}] TCP server listening on {}", self.shared.ctx.id, local);
        Ok(format!("TCP server listening on {}", local))
    }

    fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Shutting the sockets down unblocks any reader stuck in recv;
        // dropping the queues ends the writers
        for client in self.shared.clients.lock().drain(..) {
            client.disconnect();
        }
        let handles = std::mem::take(&mut *self.shared.threads.lock());
        join_bounded(handles, JOIN_TIMEOUT, &self.shared.ctx.id);

        *self.local_addr.lock() = None;
        info!("[{}] TCP server stopped", self.shared.ctx.id);
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err(Error::NotRunning(self.shared.ctx.id.clone()));
        }

        let frame: Arc<[u8]> = Arc::from(data);
        let (queued, pruned) = {
            let mut clients = self.shared.clients.lock();
            let before = clients.len();
            clients.retain(|client| match client.queue.try_send(Arc::clone(&frame)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "[{}] Client {} is not reading, disconnecting",
                        self.shared.ctx.id, client.addr
                    );
                    client.disconnect();
                    false
                }
                Err(TrySendError::Disconnected(_)) => {
                    client.disconnect();
                    false
                }
            });
            (clients.len(), before - clients.len())
        };

        if pruned > 0 {
            self.shared.ctx.changed();
            if queued == 0 {
                return Err(Error::Other(format!(
                    "All {} client(s) of '{}' failed",
                    pruned, self.shared.ctx.id
                )));
            }
        }
        Ok(queued)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn peers(&self) -> usize {
        self.shared.clients.lock().len()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Drop for TcpServerOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterHooks;
    use std::time::Instant;

    fn server() -> (TcpServerOutput, Arc<RouterHooks>) {
        let hooks = Arc::new(RouterHooks::default());
        let ctx = ChannelContext::new("srv", Arc::default(), hooks.clone());
        (TcpServerOutput::new("127.0.0.1:0".to_string(), ctx), hooks)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_fan_out_to_clients_and_relay_back() {
        let (srv, hooks) = server();
        let inbound = Arc::new(Mutex::new(Vec::new()));
        let sink = inbound.clone();
        hooks.set_relay(Arc::new(move |b: &[u8]| sink.lock().extend_from_slice(b)));

        srv.start().unwrap();
        let addr = srv.local_addr().unwrap();
        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| srv.peers() == 2));

        srv.send(b"frame").unwrap();
        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"frame");
        }

        a.write_all(b"cmd").unwrap();
        assert!(wait_for(|| inbound.lock().as_slice() == b"cmd"));

        srv.stop();
        assert!(!srv.is_running());
        assert!(matches!(srv.send(b"x"), Err(Error::NotRunning(_))));
    }

    #[test]
    fn test_disconnected_client_is_pruned() {
        let (srv, _hooks) = server();
        srv.start().unwrap();
        let addr = srv.local_addr().unwrap();
        let gone = TcpStream::connect(addr).unwrap();
        let _kept = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| srv.peers() == 2));

        drop(gone);
        assert!(wait_for(|| srv.peers() == 1));
        srv.stop();
    }

    #[test]
    fn test_send_without_clients_reports_no_delivery() {
        let (srv, _hooks) = server();
        srv.start().unwrap();
        assert_eq!(srv.send(b"frame").unwrap(), 0);
        srv.stop();
    }

    #[test]
    fn test_stalled_client_does_not_delay_fan_out() {
        let (srv, _hooks) = server();
        srv.start().unwrap();
        let addr = srv.local_addr().unwrap();
        let _stalled = TcpStream::connect(addr).unwrap();
        let mut reading = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| srv.peers() == 2));

        const FRAMES: usize = 16 * 1024;
        let frame = [0xFDu8; 1024];
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            reading.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            while total < FRAMES * 1024 {
                match reading.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
            total
        });

        let mut worst = Duration::ZERO;
        for i in 0..FRAMES {
            let started = Instant::now();
            srv.send(&frame).unwrap();
            worst = worst.max(started.elapsed());
            if i % 64 == 0 {
                thread::sleep(Duration::from_micros(500));
            }
        }

        assert!(worst < Duration::from_millis(100), "worst send took {:?}", worst);
        assert_eq!(reader.join().unwrap(), FRAMES * 1024);
        srv.stop();
    }

    #[test]
    fn test_client_threads_are_reaped() {
        let (srv, _hooks) = server();
        srv.start().unwrap();
        let addr = srv.local_addr().unwrap();

        for _ in 0..20 {
            let client = TcpStream::connect(addr).unwrap();
            assert!(wait_for(|| srv.peers() == 1));
            drop(client);
            assert!(wait_for(|| srv.peers() == 0));
        }
        let _last = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| srv.peers() == 1));

        // Accept thread, the live client's pair, and at most one departed pair
        assert!(srv.shared.threads.lock().len() <= 5);
        srv.stop();
    }

    #[test]
    fn test_stop_racing_connects_leaves_nothing_behind() {
        for _ in 0..20 {
            let (srv, _hooks) = server();
            srv.start().unwrap();
            let addr = srv.local_addr().unwrap();
            let connector = thread::spawn(move || {
                (0..5)
                    .filter_map(|_| TcpStream::connect(addr).ok())
                    .collect::<Vec<_>>()
            });
            thread::sleep(Duration::from_millis(5));
            srv.stop();
            let _clients = connector.join().unwrap();

            thread::sleep(Duration::from_millis(30));
            assert_eq!(srv.peers(), 0);
            assert!(srv.shared.threads.lock().is_empty());
        }
    }

    #[test]
    fn test_double_start_and_port_in_use() {
        let (srv, _hooks) = server();
        srv.start().unwrap();
        assert!(matches!(srv.start(), Err(Error::AlreadyRunning(_))));

        let taken = srv.local_addr().unwrap().to_string();
        let ctx = ChannelContext::new("dup", Arc::default(), Arc::default());
        let other = TcpServerOutput::new(taken, ctx);
        assert!(matches!(other.start(), Err(Error::AddrInUse(_))));
        srv.stop();
    }
}
