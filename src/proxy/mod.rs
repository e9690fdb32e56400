//! Failover TCP proxy.
//!
//! Listens on an OS-assigned loopback port and forwards every accepted
//! connection to one upstream out of a dynamic set. The last upstream that
//! accepted a connection stays selected (sticky) until a dial to it fails.
//!
//! Upstreams start inactive. A background prober dials inactive upstreams
//! every `probe_interval` and marks them active on success; only a failed
//! dial marks an upstream inactive again.

pub mod sync;


pub use sync::{spawn_upstream_sync, sync_upstreams_once, UpstreamSyncHandle};

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxySettings;

/// Proxy tuning.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How often inactive upstreams are probed.
    pub probe_interval: Duration,
    /// Timeout of each upstream dial.
    pub dial_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

impl ProxyConfig {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            probe_interval: Duration::from_millis(settings.probe_interval_ms),
            dial_timeout: Duration::from_millis(settings.dial_timeout_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Upstream {
    active: AtomicBool,
}

impl Upstream {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the handle, the accept loop and the prober.
///
/// Locks are never held across an await point.
#[derive(Debug)]
struct Shared {
    upstreams: RwLock<HashMap<String, Arc<Upstream>>>,
    current: RwLock<Option<String>>,
    no_active: AtomicBool,
    dial_timeout: Duration,
}

impl Shared {
    fn new(dial_timeout: Duration) -> Self {
        Self {
            upstreams: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            no_active: AtomicBool::new(true),
            dial_timeout,
        }
    }

    fn set_upstreams(&self, addrs: HashSet<String>) {
        let mut upstreams = write(&self.upstreams);
        if addrs.is_empty() {
            upstreams.clear();
            *write(&self.current) = None;
            self.no_active.store(true, Ordering::Release);
            return;
        }

        upstreams.retain(|addr, _| addrs.contains(addr));
        for addr in addrs {
            upstreams.entry(addr).or_default();
        }

        let mut current = write(&self.current);
        if current
            .as_ref()
            .is_some_and(|addr| !upstreams.contains_key(addr))
        {
            *current = None;
        }
    }

    /// Sticky upstream if still active, else any active one.
    fn pick(&self) -> Option<(String, Arc<Upstream>)> {
        let upstreams = read(&self.upstreams);
        if let Some(addr) = read(&self.current).as_ref() {
            if let Some(upstream) = upstreams.get(addr) {
                if upstream.is_active() {
                    return Some((addr.clone(), Arc::clone(upstream)));
                }
            }
        }
        upstreams
            .iter()
            .find(|(_, upstream)| upstream.is_active())
            .map(|(addr, upstream)| (addr.clone(), Arc::clone(upstream)))
    }

    async fn dial(&self, addr: &str) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            )),
        }
    }

    /// Connect to an active upstream, failing over until none is left.
    async fn pick_and_connect(&self) -> Option<TcpStream> {
        loop {
            let Some((addr, upstream)) = self.pick() else {
                self.no_active.store(true, Ordering::Release);
                return None;
            };
            match self.dial(&addr).await {
                Ok(stream) => {
                    upstream.set_active(true);
                    let previous = write(&self.current).replace(addr.clone());
                    self.no_active.store(false, Ordering::Release);
                    if previous.as_deref() != Some(addr.as_str()) {
                        info!(upstream = %addr, "proxy upstream selected");
                    }
                    return Some(stream);
                }
                Err(e) => {
                    warn!(upstream = %addr, error = %e, "proxy upstream dial failed");
                    upstream.set_active(false);
                    *write(&self.current) = None;
                }
            }
        }
    }

    /// Dial every inactive upstream in the background.
    fn probe_round(self: &Arc<Self>) {
        let snapshot: Vec<(String, Arc<Upstream>)> = read(&self.upstreams)
            .iter()
            .map(|(addr, upstream)| (addr.clone(), Arc::clone(upstream)))
            .collect();

        let mut active = 0usize;
        for (addr, upstream) in snapshot {
            if upstream.is_active() {
                active += 1;
                continue;
            }
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.dial(&addr).await {
                    Ok(_) => {
                        debug!(upstream = %addr, "proxy upstream probe succeeded");
                        upstream.set_active(true);
                        shared.no_active.store(false, Ordering::Release);
                    }
                    Err(e) => {
                        debug!(upstream = %addr, error = %e, "proxy upstream probe failed");
                        upstream.set_active(false);
                    }
                }
            });
        }
        if active > 0 {
            self.no_active.store(false, Ordering::Release);
        }
    }
}

/// A running failover proxy. Dropping it stops the background tasks.
#[derive(Debug)]
pub struct FailoverProxy {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl FailoverProxy {
    /// Bind a loopback listener and start the accept and probe loops.
    pub async fn new<I, S>(upstreams: I, config: ProxyConfig) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared::new(config.dial_timeout));
        shared.set_upstreams(upstreams.into_iter().map(Into::into).collect());

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), cancel.clone()));
        tokio::spawn(probe_loop(
            Arc::clone(&shared),
            config.probe_interval,
            cancel.clone(),
        ));
        info!(addr = %local_addr, "failover proxy listening");

        Ok(Self {
            shared,
            local_addr,
            cancel,
        })
    }

    /// Listening port, fixed for the proxy's lifetime.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn has_active_upstream(&self) -> bool {
        !self.shared.no_active.load(Ordering::Acquire)
    }

    /// Replace the upstream set. Known upstreams keep their state.
    pub fn set_upstreams<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared
            .set_upstreams(addrs.into_iter().map(Into::into).collect());
    }

    /// Current upstream addresses, sorted.
    pub fn upstreams(&self) -> Vec<String> {
        let mut addrs: Vec<String> = read(&self.shared.upstreams).keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Sticky upstream, if one is selected.
    pub fn current_upstream(&self) -> Option<String> {
        read(&self.shared.current).clone()
    }

    /// Token cancelled when the proxy closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting. In-flight connections run until their peers close.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(addr = %self.local_addr, "failover proxy closing");
            self.cancel.cancel();
        }
    }
}

impl Drop for FailoverProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    tokio::spawn(serve_connection(Arc::clone(&shared), client, peer));
                }
                Err(e) => {
                    warn!(error = %e, "proxy accept failed");
                }
            },
        }
    }
    debug!("proxy accept loop stopped");
}

async fn serve_connection(shared: Arc<Shared>, mut client: TcpStream, peer: SocketAddr) {
    let Some(mut upstream) = shared.pick_and_connect().await else {
        debug!(peer = %peer, "no active upstream, closing client connection");
        return;
    };

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    // Either direction finishing tears down both sockets
    let result = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut upstream_write) => r,
        r = tokio::io::copy(&mut upstream_read, &mut client_write) => r,
    };
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "proxy connection closed with error");
    }
}

async fn probe_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.probe_round(),
        }
    }
    debug!("proxy probe loop stopped");
}
