use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use crate::config::{SocketOption, SocketOptionKind};
use crate::connection::{Connection, ConnectionState};
use crate::error::DccpError;
use crate::packet_header::{ResetReason, Segment};
use crate::stats::ConnectionStats;
use crate::timers::{TimerCommand, TimerKind};
use crate::transmit::SegmentTransmit;

/// Receives the datagrams a connection delivers, in order of arrival
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, payload: Bytes);
}

struct DriverInner {
    connection: Connection,
    transmit: Arc<dyn SegmentTransmit>,
    timer_handles: FxHashMap<TimerKind, JoinHandle<()>>,
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        for (_, handle) in self.timer_handles.drain() {
            handle.abort();
        }
    }
}

/// Runs a [`Connection`] on the tokio runtime: it serializes all events for the connection,
///  schedules the timers the connection asks for, and hands delivered datagrams to a
///  [`DatagramHandler`] after the lock is released.
#[derive(Clone)]
pub struct ConnectionDriver {
    inner: Arc<Mutex<DriverInner>>,
    handler: Arc<dyn DatagramHandler>,
}

impl ConnectionDriver {
    pub fn new(connection: Connection, transmit: Arc<dyn SegmentTransmit>, handler: Arc<dyn DatagramHandler>) -> ConnectionDriver {
        ConnectionDriver {
            inner: Arc::new(Mutex::new(DriverInner {
                connection,
                transmit,
                timer_handles: FxHashMap::default(),
            })),
            handler,
        }
    }

    pub async fn connect(&self) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.connect(tx)).await
    }

    pub async fn on_segment(&self, raw: &[u8]) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.on_segment(raw, tx)).await
    }

    pub async fn send(&self, data: Bytes) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.send(data, tx)).await
    }

    pub async fn on_send_ready(&self) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.on_send_ready(tx)).await
    }

    pub async fn close(&self) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.close(tx)).await
    }

    pub async fn abort(&self) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.abort(tx)).await
    }

    async fn refuse(&self, raw: &[u8], reason: ResetReason) -> Result<(), DccpError> {
        self.handle(|conn, tx| conn.refuse(raw, reason, tx)).await
    }

    pub async fn set_option(&self, option: SocketOption) -> Result<(), DccpError> {
        self.inner.lock().await
            .connection.set_option(option)
    }

    pub async fn get_option(&self, kind: SocketOptionKind) -> SocketOption {
        self.inner.lock().await
            .connection.get_option(kind)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await
            .connection.state()
    }

    pub async fn is_destroyed(&self) -> bool {
        self.inner.lock().await
            .connection.is_destroyed()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.lock().await
            .connection.stats().clone()
    }

    async fn handle<F>(&self, f: F) -> Result<(), DccpError>
    where F: FnOnce(&mut Connection, &dyn SegmentTransmit) -> Result<(), DccpError>
    {
        let (result, received) = {
            let mut inner = self.inner.lock().await;
            let transmit = inner.transmit.clone();
            let result = f(&mut inner.connection, transmit.as_ref());
            apply_timer_commands(&self.inner, &mut inner);
            (result, drain_received(&mut inner.connection))
        };

        for payload in received {
            self.handler.on_datagram(payload).await;
        }
        result
    }
}

fn drain_received(connection: &mut Connection) -> Vec<Bytes> {
    std::iter::from_fn(|| connection.recv()).collect()
}

/// Aborts and spawns timer tasks so they match what the connection asked for. This is called
///  with the lock held, so a task that is aborted here never gets to process its expiry.
fn apply_timer_commands(inner_arc: &Arc<Mutex<DriverInner>>, inner: &mut DriverInner) {
    for command in inner.connection.timers().take_commands() {
        match command {
            TimerCommand::Stop { kind } => {
                if let Some(handle) = inner.timer_handles.remove(&kind) {
                    handle.abort();
                }
            }
            TimerCommand::Arm { kind, epoch, delay } => {
                if let Some(handle) = inner.timer_handles.remove(&kind) {
                    handle.abort();
                }
                let handle = tokio::spawn(run_timer(inner_arc.clone(), kind, epoch, delay));
                inner.timer_handles.insert(kind, handle);
            }
        }
    }
}

fn run_timer(inner_arc: Arc<Mutex<DriverInner>>, kind: TimerKind, epoch: u64, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        time::sleep(delay).await;

        let mut inner = inner_arc.lock().await;
        // this task's own handle; a replacement would have aborted it while it waited for the lock
        inner.timer_handles.remove(&kind);

        trace!("{:?} timer expired", kind);
        let transmit = inner.transmit.clone();
        if let Err(e) = inner.connection.on_timer(kind, epoch, transmit.as_ref()) {
            debug!("error handling {:?} timer: {}", kind, e);
        }
        apply_timer_commands(&inner_arc, &mut inner);
    })
}

struct ListenerInner {
    listener: Connection,
    connections: FxHashMap<u16, ConnectionDriver>,
}

/// Accepts connections on a listening [`Connection`]. Segments are routed to the derived
///  connections by the peer's port; segments from unknown peers start a new connection as long
///  as the backlog allows.
pub struct ListenerDriver {
    inner: Mutex<ListenerInner>,
    transmit: Arc<dyn SegmentTransmit>,
    handler: Arc<dyn DatagramHandler>,
}

impl ListenerDriver {
    pub fn new(mut listener: Connection, transmit: Arc<dyn SegmentTransmit>, handler: Arc<dyn DatagramHandler>) -> Result<ListenerDriver, DccpError> {
        listener.listen()?;
        Ok(ListenerDriver {
            inner: Mutex::new(ListenerInner {
                listener,
                connections: FxHashMap::default(),
            }),
            transmit,
            handler,
        })
    }

    /// Returns the driver of a connection that was created for this segment
    pub async fn on_segment(&self, raw: &[u8]) -> Result<Option<ConnectionDriver>, DccpError> {
        if raw.len() < Segment::MIN_HEADER_LEN {
            return Err(DccpError::Malformed("shorter than the minimal header"));
        }
        let remote_port = (&raw[..2]).try_get_u16()?;

        let mut inner = self.inner.lock().await;
        let existing = inner.connections.get(&remote_port).cloned();
        if let Some(existing) = existing {
            if !existing.is_destroyed().await {
                drop(inner);
                return existing.on_segment(raw).await.map(|_| None);
            }
            trace!("connection from port {} is closed - treating segment as new", remote_port);
            inner.connections.remove(&remote_port);
        }

        let mut live = 0;
        let mut destroyed = Vec::new();
        for (&port, driver) in &inner.connections {
            if driver.is_destroyed().await {
                destroyed.push(port);
            }
            else {
                live += 1;
            }
        }
        for port in destroyed {
            trace!("forgetting closed connection from port {}", port);
            inner.connections.remove(&port);
        }

        let derived = inner.listener.derive_for_request(remote_port)?;
        let backlog = inner.listener.config.backlog;
        let driver = ConnectionDriver::new(derived, self.transmit.clone(), self.handler.clone());

        if live >= backlog {
            warn!("backlog of {} connections exhausted - refusing connection from port {}", backlog, remote_port);
            driver.refuse(raw, ResetReason::TooBusy).await?;
            return Ok(None);
        }

        inner.connections.insert(remote_port, driver.clone());
        drop(inner);

        debug!("new connection from port {}", remote_port);
        driver.on_segment(raw).await?;
        Ok(Some(driver))
    }

    pub async fn num_connections(&self) -> usize {
        self.inner.lock().await
            .connections.len()
    }
}
