
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::{CallError, Result, RpcError};
use crate::transfer::{Payload, TransferList};

pub type MethodResult = std::result::Result<Payload, CallError>;

pub type MethodFn =
    Arc<dyn Fn(Vec<Value>, CallContext) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Handle to the peer a method body can talk back through while it runs.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;

    fn state(&self, key: &str) -> Option<Value>;

    fn set_state(&self, _key: &str, _value: Value) -> Result<()> {
        Err(RpcError::Unsupported("shared state"))
    }
}

#[derive(Clone)]
pub struct CallContext {
    pub peer: Arc<dyn PeerHandle>,
    pub sender: Option<String>,
    pub channel: Option<String>,
    pub transfers: TransferList,
}

impl CallContext {
    pub fn direct(peer: Arc<dyn PeerHandle>) -> Self {
        Self {
            peer,
            sender: None,
            channel: None,
            transfers: TransferList::default(),
        }
    }

    pub fn relayed(peer: Arc<dyn PeerHandle>, sender: Option<String>, channel: String) -> Self {
        Self {
            peer,
            sender,
            channel: Some(channel),
            transfers: TransferList::default(),
        }
    }

    pub fn with_transfers(mut self, transfers: TransferList) -> Self {
        self.transfers = transfers;
        self
    }
}

enum SchemaNode {
    Method(MethodFn),
    Data(Value),
    Nested(Schema),
}

/// A labeled tree of methods and data values. Consumed exactly once by
/// [`Schema::extract`]: methods out into a dotted-path map, data retained.
#[derive(Default)]
pub struct Schema {
    entries: BTreeMap<String, SchemaNode>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let func = Arc::new(func);
        let wrapped: MethodFn = Arc::new(move |args, ctx| Box::pin(func(args, ctx)));
        self.entries.insert(name.into(), SchemaNode::Method(wrapped));
        self
    }

    pub fn data(mut self, name: impl Into<String>, value: Value) -> Self {
        self.entries.insert(name.into(), SchemaNode::Data(value));
        self
    }

    pub fn nested(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.entries
            .insert(name.into(), SchemaNode::Nested(schema));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extract(self) -> (MethodMap, Value) {
        let mut methods = HashMap::new();
        let data = extract_into(self, String::new(), &mut methods);
        (MethodMap { methods }, data)
    }
}

fn extract_into(schema: Schema, prefix: String, methods: &mut HashMap<String, MethodFn>) -> Value {
    let mut data = Map::new();
    for (name, node) in schema.entries {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        match node {
            SchemaNode::Method(func) => {
                methods.insert(path, func);
            }
            SchemaNode::Data(value) => {
                data.insert(name, value);
            }
            SchemaNode::Nested(inner) => {
                let nested = extract_into(inner, path, methods);
                data.insert(name, nested);
            }
        }
    }
    Value::Object(data)
}

#[derive(Clone, Default)]
pub struct MethodMap {
    methods: HashMap<String, MethodFn>,
}

impl MethodMap {
    pub fn get(&self, path: &str) -> Option<&MethodFn> {
        self.methods.get(path)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodMap")
            .field("methods", &self.names())
            .finish()
    }
}

pub fn data_at<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = tree;
    for part in path.split('.') {
        node = node.as_object()?.get(part)?;
    }
    Some(node)
}
