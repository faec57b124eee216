
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

/// A transferable byte buffer: moved across the channel, never copied.
/// Cloning the handle shares one detachable slot.
#[derive(Debug, Clone)]
pub struct TransferBuf {
    slot: Arc<Mutex<Option<Bytes>>>,
}

impl TransferBuf {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.slot.lock().as_ref().map(|b| b.len())
    }

    pub fn is_detached(&self) -> bool {
        self.slot.lock().is_none()
    }

    pub fn contents(&self) -> Option<Bytes> {
        self.slot.lock().clone()
    }

    pub(crate) fn detach_for_send(&self) -> Option<TransferBuf> {
        self.slot.lock().take().map(TransferBuf::new)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferList(pub Vec<TransferBuf>);

impl TransferList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn detach_for_send(&self) -> TransferList {
        TransferList(
            self.0
                .iter()
                .filter_map(TransferBuf::detach_for_send)
                .collect(),
        )
    }
}

impl From<Vec<TransferBuf>> for TransferList {
    fn from(bufs: Vec<TransferBuf>) -> Self {
        TransferList(bufs)
    }
}

/// A structured value plus the buffers that travel with it.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub value: Value,
    pub transfers: TransferList,
}

impl Payload {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            transfers: TransferList::default(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::new(value)
    }
}

pub struct TransferRecorder {
    recorded: Vec<TransferBuf>,
}

impl TransferRecorder {
    pub fn transfer(&mut self, buf: TransferBuf) -> TransferBuf {
        self.recorded.push(buf.clone());
        buf
    }
}

/// Build a [`Payload`] nominating buffers for ownership transfer. The
/// `transfer` helper records the buffer and hands it back, so callers can
/// splice transferables into arbitrary return shapes.
pub fn with_transfer(build: impl FnOnce(&mut TransferRecorder) -> Value) -> Payload {
    let mut recorder = TransferRecorder {
        recorded: Vec::new(),
    };
    let value = build(&mut recorder);
    Payload {
        value,
        transfers: TransferList(recorder.recorded),
    }
}
