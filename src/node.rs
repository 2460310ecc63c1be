use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::trace;

use crate::descriptor::NodeDescriptor;
use crate::error::NodeError;
use crate::logger::{LogLevel, LogRecord, LoggerType, TracingLogger};
use crate::message::Message;
use crate::runtime::Runtime;

/// Builds the behaviour of one node instance from its descriptor.
///
/// Constructors may register close handlers on `node` and read its
/// credentials. Returning an error leaves the node out of the flow.
pub trait NodeType: Send + Sync {
    fn create(&self, node: &Arc<Node>, config: &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError>;
}

impl<F> NodeType for F
where
    F: Fn(&Arc<Node>, &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError> + Send + Sync,
{
    fn create(&self, node: &Arc<Node>, config: &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError> {
        self(node, config)
    }
}

/// What a node does with its input.
pub trait NodeBehavior: Send + Sync {
    fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        let _ = (node, msg);
        Ok(())
    }
}

/// Argument to [`Node::send`]: one message for output 0, or one group of
/// messages per output (an empty group sends nothing on that output).
#[derive(Debug)]
pub enum Outgoing {
    Single(Message),
    Ports(Vec<Vec<Message>>),
}

impl From<Message> for Outgoing {
    fn from(msg: Message) -> Self {
        Outgoing::Single(msg)
    }
}

impl From<Vec<Vec<Message>>> for Outgoing {
    fn from(ports: Vec<Vec<Message>>) -> Self {
        Outgoing::Ports(ports)
    }
}

impl From<Vec<Option<Message>>> for Outgoing {
    fn from(ports: Vec<Option<Message>>) -> Self {
        Outgoing::Ports(ports.into_iter().map(|m| m.into_iter().collect()).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn new(fill: &str, shape: &str, text: impl Into<String>) -> Self {
        Self { fill: Some(fill.to_string()), shape: Some(shape.to_string()), text: Some(text.into()) }
    }
}

pub type CloseFuture = BoxFuture<'static, Result<(), NodeError>>;

pub enum CloseHandler {
    Sync(Box<dyn FnOnce() -> Result<(), NodeError> + Send>),
    Async(Box<dyn FnOnce() -> CloseFuture + Send>),
}

impl CloseHandler {
    pub fn sync(f: impl FnOnce() -> Result<(), NodeError> + Send + 'static) -> Self {
        CloseHandler::Sync(Box::new(f))
    }

    pub fn asynchronous(f: impl FnOnce() -> CloseFuture + Send + 'static) -> Self {
        CloseHandler::Async(Box::new(f))
    }
}

/// Outcome of [`Node::close`].
pub enum Closing {
    /// Every handler was synchronous; holds the first failure, if any.
    Done(Result<(), NodeError>),
    /// At least one handler is asynchronous; resolves once all have settled.
    Pending(CloseFuture),
}

#[derive(Debug)]
struct Wiring {
    wires: Vec<Vec<String>>,
    connected: bool,
    single_target: Option<String>,
}

impl Wiring {
    fn new(wires: Vec<Vec<String>>) -> Self {
        let connected = wires.iter().any(|port| !port.is_empty());
        let single_target = match wires.as_slice() {
            [port] if port.len() == 1 => Some(port[0].clone()),
            _ => None,
        };
        Self { wires, connected, single_target }
    }
}

/// A live node instance.
pub struct Node {
    id: String,
    type_name: String,
    name: Option<String>,
    z: Option<String>,
    alias: Option<String>,
    credentials: Option<Map<String, Value>>,
    wiring: RwLock<Arc<Wiring>>,
    behavior: OnceLock<Box<dyn NodeBehavior>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    runtime: Weak<Runtime>,
    received: AtomicU64,
    closed: AtomicBool,
}

impl Node {
    pub fn new(config: &NodeDescriptor, credentials: Option<Map<String, Value>>, runtime: Weak<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            id: config.id.clone(),
            type_name: config.type_name.clone(),
            name: config.name.clone(),
            z: config.z.clone(),
            alias: config.alias.clone(),
            credentials,
            wiring: RwLock::new(Arc::new(Wiring::new(config.wires.clone()))),
            behavior: OnceLock::new(),
            close_handlers: Mutex::new(Vec::new()),
            runtime,
            received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn z(&self) -> Option<&str> {
        self.z.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn credentials(&self) -> Option<&Map<String, Value>> {
        self.credentials.as_ref()
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.upgrade()
    }

    pub fn wires(&self) -> Vec<Vec<String>> {
        self.wiring.read().wires.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.wiring.read().connected
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn update_wires(&self, wires: Vec<Vec<String>>) {
        trace!(node = %self.id, ?wires, "update wires");
        *self.wiring.write() = Arc::new(Wiring::new(wires));
    }

    pub(crate) fn set_behavior(&self, behavior: Box<dyn NodeBehavior>) {
        let _ = self.behavior.set(behavior);
    }

    pub fn on_close(&self, handler: CloseHandler) {
        self.close_handlers.lock().push(handler);
    }

    /// Delivers messages along this node's wires.
    ///
    /// Each message object reaches its first target as-is; every further
    /// target gets a deep copy taken before any delivery. All deliveries
    /// share one correlation id and run to completion before this returns.
    pub fn send(&self, out: impl Into<Outgoing>) {
        let wiring = self.wiring.read().clone();
        if !wiring.connected {
            return;
        }
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };

        let ports = match out.into() {
            Outgoing::Single(mut msg) => {
                if let Some(target) = &wiring.single_target {
                    if let Some(node) = runtime.node(target) {
                        let msg_id = msg.ensure_id().to_string();
                        trace!(target: "flowwire::metric", event = "node.send", node = %self.id, msgid = %msg_id);
                        node.receive(msg);
                    }
                    return;
                }
                vec![vec![msg]]
            }
            Outgoing::Ports(ports) => ports,
        };

        let mut sent_id: Option<String> = None;
        let mut deliveries: Vec<(Arc<Node>, Message)> = Vec::new();
        for (group, targets) in ports.into_iter().zip(wiring.wires.iter()) {
            let targets: Vec<Arc<Node>> = targets.iter().filter_map(|id| runtime.node(id)).collect();
            let Some((first, rest)) = targets.split_first() else {
                continue;
            };
            for mut msg in group {
                let id = sent_id
                    .get_or_insert_with(|| msg.ensure_id().to_string())
                    .clone();
                if msg.id().is_none() {
                    msg.set_id(id);
                }
                let copies: Vec<Message> = rest.iter().map(|_| msg.clone()).collect();
                deliveries.push((first.clone(), msg));
                deliveries.extend(rest.iter().cloned().zip(copies));
            }
        }

        if let Some(id) = &sent_id {
            trace!(target: "flowwire::metric", event = "node.send", node = %self.id, msgid = %id, count = deliveries.len());
        }
        for (node, msg) in deliveries {
            node.receive(msg);
        }
    }

    /// Hands a message to this node's behaviour. Failures are reported via
    /// [`Node::error`] and never reach the sender.
    pub fn receive(&self, mut msg: Message) {
        if self.is_closed() {
            return;
        }
        let msg_id = msg.ensure_id().to_string();
        self.received.fetch_add(1, Ordering::Relaxed);
        trace!(target: "flowwire::metric", event = "node.receive", node = %self.id, msgid = %msg_id);

        let Some(behavior) = self.behavior.get() else {
            return;
        };
        let trigger = msg.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| behavior.on_input(self, msg))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.error(e, Some(&trigger)),
            Err(panic) => self.error(NodeError::Panicked(panic_message(panic.as_ref())), Some(&trigger)),
        }
    }

    /// Runs every registered close handler once. Later deliveries to this
    /// node are dropped.
    pub fn close(&self) -> Closing {
        self.closed.store(true, Ordering::SeqCst);
        let handlers = std::mem::take(&mut *self.close_handlers.lock());

        let mut failure = None;
        let mut pending = Vec::new();
        for handler in handlers {
            match handler {
                CloseHandler::Sync(f) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                        .unwrap_or_else(|p| Err(NodeError::Panicked(panic_message(p.as_ref()))));
                    if let Err(e) = outcome {
                        failure.get_or_insert(e);
                    }
                }
                CloseHandler::Async(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(close) => pending.push(settle(close)),
                    Err(p) => {
                        failure.get_or_insert(NodeError::Panicked(panic_message(p.as_ref())));
                    }
                },
            }
        }

        if pending.is_empty() {
            return Closing::Done(failure.map_or(Ok(()), Err));
        }
        Closing::Pending(
            async move {
                let results = join_all(pending).await;
                match failure {
                    Some(e) => Err(e),
                    None => results.into_iter().collect(),
                }
            }
            .boxed(),
        )
    }

    pub fn log(&self, msg: impl fmt::Display) {
        self.emit_log(LogLevel::Info, msg.to_string());
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.emit_log(LogLevel::Warn, msg.to_string());
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        self.emit_log(LogLevel::Debug, msg.to_string());
    }

    pub fn trace(&self, msg: impl fmt::Display) {
        self.emit_log(LogLevel::Trace, msg.to_string());
    }

    /// Logs the error and hands it to the owning flow's catch nodes,
    /// together with the message that caused it when known.
    pub fn error(&self, err: impl fmt::Display, msg: Option<&Message>) {
        let text = err.to_string();
        self.emit_log(LogLevel::Error, text.clone());
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.handle_error(self, &text, msg);
        }
    }

    /// Publishes `status/<id>` (retained) and notifies status nodes.
    pub fn status(&self, status: NodeStatus) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let data = serde_json::to_value(&status).unwrap_or(Value::Null);
        runtime.comms().publish(&format!("status/{}", self.id), data, true);
        runtime.handle_status(self, &status);
    }

    fn emit_log(&self, level: LogLevel, msg: String) {
        let record = LogRecord {
            level,
            id: self.id.clone(),
            node_type: self.type_name.clone(),
            name: self.name.clone(),
            msg,
            timestamp: Utc::now(),
        };
        match self.runtime.upgrade() {
            Some(runtime) => runtime.logger().log(&record),
            None => TracingLogger.log(&record),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("z", &self.z)
            .field("wires", &self.wiring.read().wires)
            .finish()
    }
}

/// Turns a panic inside an asynchronous close handler into an error.
fn settle(close: CloseFuture) -> CloseFuture {
    AssertUnwindSafe(close)
        .catch_unwind()
        .map(|outcome| outcome.unwrap_or_else(|p| Err(NodeError::Panicked(panic_message(p.as_ref())))))
        .boxed()
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
