
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, RpcError};
use crate::protocol::Envelope;

pub mod origin;

pub use origin::normalize_origin;

pub type PortId = u64;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

fn next_port_id() -> PortId {
    NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Flavor of the channel behind an endpoint, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    Worker,
    Frame { source_url: Option<String> },
    Port,
    Thread,
}

/// An inbound event. Thread-style channels deliver the envelope bare;
/// the browser-style flavors wrap it with the sender's origin and source.
#[derive(Debug, Clone)]
pub enum PortEvent {
    Raw(Envelope),
    Wrapped {
        data: Envelope,
        origin: String,
        source: Option<PortId>,
    },
}

impl PortEvent {
    /// The inner envelope, whether the event wraps it or is it.
    pub fn payload(&self) -> &Envelope {
        match self {
            PortEvent::Raw(data) => data,
            PortEvent::Wrapped { data, .. } => data,
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            PortEvent::Raw(_) => None,
            PortEvent::Wrapped { origin, .. } => Some(origin),
        }
    }

    pub fn source(&self) -> Option<PortId> {
        match self {
            PortEvent::Raw(_) => None,
            PortEvent::Wrapped { source, .. } => *source,
        }
    }
}

enum WireItem {
    Event(PortEvent),
    Closed,
}

pub type Handler = Arc<dyn Fn(&PortEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Counters kept per endpoint half.
#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_errors: u64,
}

struct EndpointShared {
    kind: EndpointKind,
    peer_id: PortId,
    local_id: PortId,
    local_origin: String,
    to_peer: mpsc::UnboundedSender<WireItem>,
    to_self: mpsc::UnboundedSender<WireItem>,
    closed: Arc<AtomicBool>,
    listeners: Mutex<Vec<(HandlerId, Handler)>>,
    next_handler: AtomicU64,
    stats: Mutex<PortStats>,
}

/// A handle for "the other side" of a structured-clone message channel.
/// Cloning shares the same half; `close` closes the whole pair.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    pub fn worker_pair() -> (Endpoint, Endpoint) {
        link(
            HalfSpec::plain(EndpointKind::Worker),
            HalfSpec::plain(EndpointKind::Worker),
        )
    }

    pub fn thread_pair() -> (Endpoint, Endpoint) {
        link(
            HalfSpec::plain(EndpointKind::Thread),
            HalfSpec::plain(EndpointKind::Thread),
        )
    }

    pub fn port_pair() -> (Endpoint, Endpoint) {
        link(
            HalfSpec::plain(EndpointKind::Port),
            HalfSpec::plain(EndpointKind::Port),
        )
    }

    pub fn frame_pair(parent_url: &str, child_url: &str) -> (Endpoint, Endpoint) {
        Self::frame_pair_declared(parent_url, child_url, Some(child_url))
    }

    pub fn frame_pair_declared(
        parent_url: &str,
        child_url: &str,
        declared_child_url: Option<&str>,
    ) -> (Endpoint, Endpoint) {
        link(
            // The parent half, as declared to the child.
            HalfSpec {
                kind: EndpointKind::Frame {
                    source_url: Some(parent_url.to_string()),
                },
                local_origin: normalize_origin(parent_url).unwrap_or_default(),
            },
            // The child half: declared source as the parent believes it,
            // actual origin from where the child really runs.
            HalfSpec {
                kind: EndpointKind::Frame {
                    source_url: declared_child_url.map(str::to_string),
                },
                local_origin: normalize_origin(child_url).unwrap_or_default(),
            },
        )
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.shared.kind
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// Dispatch an envelope to the peer, detaching any transfer buffers it
    /// carries. A frame send whose `target_origin` mismatches the declared
    /// origin is dropped, not delivered.
    pub fn send(&self, mut envelope: Envelope, target_origin: Option<&str>) -> Result<()> {
        if !self.is_open() {
            return Err(RpcError::TransportUnavailable("port closed".into()));
        }

        if let EndpointKind::Frame { source_url } = &self.shared.kind {
            if let Some(expected) = target_origin.filter(|o| *o != "*") {
                let peer_origin = source_url.as_deref().and_then(normalize_origin);
                if peer_origin.as_deref() != Some(expected) {
                    tracing::warn!(
                        target_origin = expected,
                        peer_origin = peer_origin.as_deref().unwrap_or(""),
                        "dropping frame message: target origin mismatch"
                    );
                    self.shared.stats.lock().send_errors += 1;
                    return Ok(());
                }
            }
        }

        envelope.detach_transfers();

        let event = match self.shared.kind {
            EndpointKind::Thread => PortEvent::Raw(envelope),
            _ => PortEvent::Wrapped {
                data: envelope,
                origin: self.shared.local_origin.clone(),
                source: Some(self.shared.local_id),
            },
        };

        match self.shared.to_peer.send(WireItem::Event(event)) {
            Ok(()) => {
                self.shared.stats.lock().messages_sent += 1;
                Ok(())
            }
            Err(_) => {
                self.shared.stats.lock().send_errors += 1;
                Err(RpcError::TransportUnavailable("peer port gone".into()))
            }
        }
    }

    pub fn subscribe(&self, handler: Handler) -> HandlerId {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.lock().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) {
        self.shared.listeners.lock().retain(|(hid, _)| *hid != id);
    }

    /// Normalized origin of a frame's declared source URL; `None` otherwise.
    pub fn origin_of(&self) -> Option<String> {
        match &self.shared.kind {
            EndpointKind::Frame { source_url } => {
                source_url.as_deref().and_then(normalize_origin)
            }
            _ => None,
        }
    }

    /// Worker-likes are trusted by isolation; frame-likes require the
    /// event's origin and source to match the declared frame. A frame with
    /// no declared source passes trivially.
    pub fn is_valid_frame_message(&self, event: &PortEvent) -> bool {
        match &self.shared.kind {
            EndpointKind::Frame { source_url } => {
                if source_url.is_none() {
                    return true;
                }
                let origin_ok = match (self.origin_of(), event.origin()) {
                    (Some(expected), Some(actual)) => expected == actual,
                    _ => false,
                };
                origin_ok && event.source() == Some(self.shared.peer_id)
            }
            _ => true,
        }
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.to_peer.send(WireItem::Closed);
        let _ = self.shared.to_self.send(WireItem::Closed);
    }

    pub fn terminate(&self) {
        self.close();
    }

    pub fn stats(&self) -> PortStats {
        self.shared.stats.lock().clone()
    }

    pub fn port_id(&self) -> PortId {
        self.shared.local_id
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.shared.kind)
            .field("local_id", &self.shared.local_id)
            .field("open", &self.is_open())
            .finish()
    }
}

struct HalfSpec {
    kind: EndpointKind,
    local_origin: String,
}

impl HalfSpec {
    fn plain(kind: EndpointKind) -> Self {
        Self {
            kind,
            local_origin: String::new(),
        }
    }
}

fn link(a: HalfSpec, b: HalfSpec) -> (Endpoint, Endpoint) {
    let id_a = next_port_id();
    let id_b = next_port_id();
    let closed = Arc::new(AtomicBool::new(false));

    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    // Handle held by side A: classified as B's flavor, sends into B's pump,
    // stamps A's identity.
    let ep_a = Endpoint {
        shared: Arc::new(EndpointShared {
            kind: b.kind,
            peer_id: id_b,
            local_id: id_a,
            local_origin: a.local_origin,
            to_peer: tx_b.clone(),
            to_self: tx_a.clone(),
            closed: closed.clone(),
            listeners: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            stats: Mutex::new(PortStats::default()),
        }),
    };

    let ep_b = Endpoint {
        shared: Arc::new(EndpointShared {
            kind: a.kind,
            peer_id: id_a,
            local_id: id_b,
            local_origin: b.local_origin,
            to_peer: tx_a,
            to_self: tx_b.clone(),
            closed,
            listeners: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            stats: Mutex::new(PortStats::default()),
        }),
    };

    spawn_pump(Arc::downgrade(&ep_a.shared), rx_a);
    spawn_pump(Arc::downgrade(&ep_b.shared), rx_b);

    (ep_a, ep_b)
}

fn spawn_pump(shared: Weak<EndpointShared>, mut rx: mpsc::UnboundedReceiver<WireItem>) {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let event = match item {
                WireItem::Event(event) => event,
                WireItem::Closed => break,
            };
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.stats.lock().messages_received += 1;
            let handlers: Vec<Handler> = shared
                .listeners
                .lock()
                .iter()
                .map(|(_, h)| h.clone())
                .collect();
            for handler in handlers {
                handler(&event);
            }
        }
    });
}

static HOST_SLOT: Mutex<Option<Endpoint>> = Mutex::new(None);

pub fn install_host(endpoint: Endpoint) {
    *HOST_SLOT.lock() = Some(endpoint);
}

pub fn clear_host() {
    *HOST_SLOT.lock() = None;
}

/// The endpoint naming this context's parent, when one is installed.
pub fn auto_host() -> Result<Endpoint> {
    HOST_SLOT.lock().clone().ok_or(RpcError::NoHost)
}
