//! UDP output: datagrams to a fixed remote, replies read on the ephemeral
//! local port.

use super::{
    ChannelContext, JOIN_TIMEOUT, OutputChannel, SOCKET_READ_TIMEOUT, is_timeout, join_bounded,
    resolve,
};
use crate::error::{Error, Result};
use log::{debug, info};
use parking_lot::Mutex;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

struct Shared {
    ctx: ChannelContext,
    running: AtomicBool,
}

struct Active {
    socket: UdpSocket,
    remote: SocketAddr,
    reader: JoinHandle<()>,
}

pub struct UdpOutput {
    remote: String,
    shared: Arc<Shared>,
    active: Mutex<Option<Active>>,
}

impl UdpOutput {
    pub fn new(remote: String, ctx: ChannelContext) -> Self {
        Self {
            remote,
            shared: Arc::new(Shared {
                ctx,
                running: AtomicBool::new(false),
            }),
            active: Mutex::new(None),
        }
    }

    fn read_loop(shared: Arc<Shared>, socket: UdpSocket) {
        let mut buf = [0u8; 2048];
        while shared.running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, _from)) if n > 0 => shared.ctx.deliver(&buf[..n]),
                Ok(_) => {}
                Err(ref e) if is_timeout(e) => {}
                // ICMP port unreachable surfaces here on some platforms
                Err(e) => debug!("[{}] UDP receive error: {}", shared.ctx.id, e),
            }
        }
    }
}

impl OutputChannel for UdpOutput {
    fn start(&self) -> Result<String> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::AlreadyRunning(self.shared.ctx.id.clone()));
        }

        let remote = resolve(&self.remote)?;
        let bind = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).map_err(|e| Error::from_socket(e, bind))?;
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
        let reader_socket = socket.try_clone()?;

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let reader = match thread::Builder::new()
            .name(format!("{}-udp", self.shared.ctx.id))
            .spawn(move || Self::read_loop(shared, reader_socket))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let local = socket.local_addr()?;
        *active = Some(Active {
            socket,
            remote,
            reader,
        });
        info!(
            "[{}] UDP output {} -> {}",
            self.shared.ctx.id, local, remote
        );
        Ok(format!("Sending to {} from {}", remote, local))
    }

    fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        join_bounded(vec![active.reader], JOIN_TIMEOUT, &self.shared.ctx.id);
        info!("[{}] UDP output stopped", self.shared.ctx.id);
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        let active = self.active.lock();
        let active = active
            .as_ref()
            .ok_or_else(|| Error::NotRunning(self.shared.ctx.id.clone()))?;
        active.socket.send_to(data, active.remote)?;
        Ok(1)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .lock()
            .as_ref()
            .and_then(|a| a.socket.local_addr().ok())
    }
}

impl Drop for UdpOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
