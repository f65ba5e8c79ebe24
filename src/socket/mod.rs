//! Guest-side socket emulation.
//!
//! A [`SocketPlugin`] owns the state shared by every socket of one guest:
//! the lookup cache, the set of targets known to need the CORS proxy, and
//! whether the relay tunnel is usable. Handles created from it borrow that
//! state by reference.
//!
//! Everything here runs on a single thread and spawns with
//! `tokio::task::spawn_local`, so plugin and handle methods must be called
//! from within a `LocalSet`.

mod config;
mod fallback;
mod frame;
mod handle;
mod http;
mod tunnel;
mod websocket;

pub use config::GuestConfig;
pub use fallback::{Tier, ladder};
pub use frame::{Frame, MAX_FRAME_LEN, Opcode, accept_key, decode_frame, encode_frame, handshake_response};
pub use handle::{SocketHandle, SocketStatus};
pub use http::{HttpRequest, response_head};
pub use tunnel::{ChannelEvent, TunnelChannel};

use std::cell::{Cell, Ref, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lookup::LookupCache;

/// Receives semaphore signals for the guest.
pub trait Signaller {
    fn signal(&self, semaphore: i32);
}

impl<F: Fn(i32)> Signaller for F {
    fn signal(&self, semaphore: i32) {
        self(semaphore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverStatus {
    Uninitialized,
    Ready,
    Busy,
    Error,
}

impl ResolverStatus {
    pub fn code(self) -> i32 {
        match self {
            ResolverStatus::Uninitialized => 0,
            ResolverStatus::Ready => 1,
            ResolverStatus::Busy => 2,
            ResolverStatus::Error => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LastLookup {
    Name(String),
    Address(Ipv4Addr),
}

struct ResolverState {
    status: ResolverStatus,
    last_lookup: Option<LastLookup>,
    /// Bumped per lookup so superseded results do not signal.
    generation: u64,
    semaphore: i32,
}

pub(crate) struct Shared {
    pub(crate) config: GuestConfig,
    signaller: Box<dyn Signaller>,
    pub(crate) lookup: RefCell<LookupCache>,
    needs_proxy: RefCell<FxHashSet<String>>,
    tunnel_unavailable: RefCell<Option<String>>,
    pub(crate) http: reqwest::Client,
    resolver: RefCell<ResolverState>,
    handle_counter: Cell<u32>,
}

impl Shared {
    /// Signal a guest semaphore. Indices of zero or less are unset.
    pub(crate) fn signal(&self, semaphore: i32) {
        if semaphore > 0 {
            self.signaller.signal(semaphore);
        }
    }

    pub(crate) fn tunnel_enabled(&self) -> bool {
        self.config.enable_tunnel && self.tunnel_unavailable.borrow().is_none()
    }

    /// Stop using the tunnel for the rest of the plugin's life.
    pub(crate) fn disable_tunnel(&self, reason: String) {
        let mut unavailable = self.tunnel_unavailable.borrow_mut();
        if unavailable.is_some() {
            return;
        }
        warn!(%reason, "disabling tcp tunnel");
        *unavailable = Some(reason);
    }

    pub(crate) fn needs_proxy(&self, key: &str) -> bool {
        self.needs_proxy.borrow().contains(key)
    }

    pub(crate) fn mark_needs_proxy(&self, key: String) {
        self.needs_proxy.borrow_mut().insert(key);
    }

    fn finish_lookup(&self, generation: Option<u64>) {
        let semaphore = {
            let mut resolver = self.resolver.borrow_mut();
            if generation.is_some_and(|g| g != resolver.generation) {
                return;
            }
            resolver.status = ResolverStatus::Ready;
            resolver.semaphore
        };
        self.signal(semaphore);
    }
}

/// Socket and resolver primitives for one guest.
pub struct SocketPlugin {
    shared: Rc<Shared>,
}

impl SocketPlugin {
    pub fn new(config: GuestConfig, signaller: impl Signaller + 'static) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            shared: Rc::new(Shared {
                config,
                signaller: Box::new(signaller),
                lookup: RefCell::new(LookupCache::new()),
                needs_proxy: RefCell::new(FxHashSet::default()),
                tunnel_unavailable: RefCell::new(None),
                http,
                resolver: RefCell::new(ResolverState {
                    status: ResolverStatus::Uninitialized,
                    last_lookup: None,
                    generation: 0,
                    semaphore: 0,
                }),
                handle_counter: Cell::new(0),
            }),
        })
    }

    pub fn has_socket_access(&self) -> bool {
        true
    }

    /// Create a TCP socket signalling the given semaphores.
    pub fn create_socket(&self, conn_sema: i32, read_sema: i32, write_sema: i32) -> SocketHandle {
        let n = self.shared.handle_counter.get() + 1;
        self.shared.handle_counter.set(n);

        SocketHandle::new(
            format!("{{Socket #{n}}}"),
            self.shared.clone(),
            [conn_sema, read_sema, write_sema],
        )
    }

    pub fn initialize_network(&self, lookup_sema: i32) {
        let mut resolver = self.shared.resolver.borrow_mut();
        resolver.semaphore = lookup_sema;
        resolver.status = ResolverStatus::Ready;
    }

    pub fn resolver_status(&self) -> ResolverStatus {
        self.shared.resolver.borrow().status
    }

    /// Start resolving `name`, replacing any lookup in progress.
    ///
    /// Cached names and literal addresses complete immediately. Otherwise
    /// the name is resolved over a tunnel channel when the tunnel is usable.
    pub fn start_name_lookup(&self, name: &str) {
        let generation = {
            let mut resolver = self.shared.resolver.borrow_mut();
            resolver.last_lookup = Some(LastLookup::Name(name.to_string()));
            resolver.generation += 1;
            resolver.generation
        };

        let cached = self.shared.lookup.borrow().get(name, false).is_some();
        if cached || !self.shared.tunnel_enabled() {
            self.shared.finish_lookup(None);
            return;
        }

        tokio::task::spawn_local(lookup_via_tunnel(
            self.shared.clone(),
            name.to_string(),
            generation,
        ));

        let semaphore = {
            let mut resolver = self.shared.resolver.borrow_mut();
            resolver.status = ResolverStatus::Busy;
            resolver.semaphore
        };
        self.shared.signal(semaphore);
    }

    /// Address for the last name lookup, expired entries included.
    pub fn name_lookup_result(&self) -> Option<Ipv4Addr> {
        match &self.shared.resolver.borrow().last_lookup {
            Some(LastLookup::Name(name)) => self.shared.lookup.borrow().get(name, true),
            _ => None,
        }
    }

    pub fn start_address_lookup(&self, address: Ipv4Addr) {
        {
            let mut resolver = self.shared.resolver.borrow_mut();
            resolver.last_lookup = Some(LastLookup::Address(address));
            resolver.generation += 1;
        }
        self.shared.finish_lookup(None);
    }

    /// Name for the last address lookup.
    pub fn address_lookup_result(&self) -> Option<String> {
        match &self.shared.resolver.borrow().last_lookup {
            Some(LastLookup::Address(address)) => Some(self.shared.lookup.borrow().reverse(*address)),
            _ => None,
        }
    }

    /// Forget the lookup in progress. Its result will not signal.
    pub fn abort_lookup(&self) {
        {
            let mut resolver = self.shared.resolver.borrow_mut();
            resolver.last_lookup = None;
            resolver.generation += 1;
        }
        self.shared.finish_lookup(None);
    }

    pub fn lookup_cache(&self) -> Ref<'_, LookupCache> {
        self.shared.lookup.borrow()
    }

    /// Why the tunnel was disabled, if it was.
    pub fn tunnel_unavailable_reason(&self) -> Option<String> {
        self.shared.tunnel_unavailable.borrow().clone()
    }

    /// Whether HTTP requests to `host:port` go straight to the CORS proxy.
    pub fn needs_proxy(&self, host: &str, port: u16) -> bool {
        self.shared.needs_proxy(&format!("{host}:{port}"))
    }
}

async fn lookup_via_tunnel(shared: Rc<Shared>, name: String, generation: u64) {
    let candidates = shared.config.tunnel_candidates();

    match TunnelChannel::lookup(&candidates, &name).await {
        Ok(Some(answer)) => {
            let address = shared.lookup.borrow_mut().insert_answer(&answer);
            debug!(%name, ?address, "tunnel lookup answered");
        }
        Ok(None) => {}
        Err(Error::TunnelUnavailable(reason)) => shared.disable_tunnel(reason),
        Err(e) => debug!(%name, error = %e, "tunnel lookup failed"),
    }

    shared.finish_lookup(Some(generation));
}
