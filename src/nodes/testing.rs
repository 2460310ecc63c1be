//! Node types and a runtime harness shared by the unit tests.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::comms::{Comms, RetainedComms};
use crate::config::{MemorySettings, Settings};
use crate::credentials::CredentialStore;
use crate::descriptor::NodeDescriptor;
use crate::error::NodeError;
use crate::logger::tests::MemoryLogger;
use crate::logger::{LogLevel, LogRecord, Logger};
use crate::message::Message;
use crate::node::{CloseHandler, Node, NodeBehavior, NodeType};
use crate::nodes::register_builtins;
use crate::registry::{RegisterOptions, TypeRegistry};
use crate::runtime::Runtime;
use crate::storage::MemoryStorage;

#[derive(Debug, Clone)]
pub(crate) struct Seen {
    pub msg: Message,
    pub ptr: usize,
}

#[derive(Default)]
struct JournalInner {
    seen: HashMap<String, Vec<Seen>>,
    created: HashMap<String, usize>,
    closed: HashMap<String, usize>,
}

/// What test nodes saw, keyed by template id for subflow clones.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<JournalInner>>);

impl Journal {
    fn key(node: &Node) -> String {
        node.alias().unwrap_or(node.id()).to_string()
    }

    fn record(&self, node: &Node, msg: &Message) {
        let seen = Seen { msg: msg.clone(), ptr: msg.body_ptr() as usize };
        self.0.lock().seen.entry(Self::key(node)).or_default().push(seen);
    }

    fn created_node(&self, node: &Node) {
        *self.0.lock().created.entry(Self::key(node)).or_default() += 1;
    }

    fn closed_node(&self, key: String) {
        *self.0.lock().closed.entry(key).or_default() += 1;
    }

    pub fn received(&self, key: &str) -> usize {
        self.0.lock().seen.get(key).map_or(0, Vec::len)
    }

    pub fn messages(&self, key: &str) -> Vec<Message> {
        self.0
            .lock()
            .seen
            .get(key)
            .map(|v| v.iter().map(|s| s.msg.clone()).collect())
            .unwrap_or_default()
    }

    pub fn take(&self, key: &str) -> Vec<Seen> {
        self.0.lock().seen.remove(key).unwrap_or_default()
    }

    pub fn created(&self, key: &str) -> usize {
        self.0.lock().created.get(key).copied().unwrap_or(0)
    }

    pub fn closed(&self, key: &str) -> usize {
        self.0.lock().closed.get(key).copied().unwrap_or(0)
    }
}

/// Forwards every input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Passthrough;

impl NodeBehavior for Passthrough {
    fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        node.send(msg);
        Ok(())
    }
}

impl NodeType for Passthrough {
    fn create(&self, _node: &Arc<Node>, _config: &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError> {
        Ok(Box::new(Passthrough))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Record,
    Sink,
    Fail,
    Panic,
    SlowClose,
    BadClose,
    PanicClose,
    Complain,
}

struct TestNode {
    journal: Journal,
    mode: Mode,
    stamp: Option<Value>,
}

impl NodeBehavior for TestNode {
    fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        match self.mode {
            Mode::Fail => Err(NodeError::ExecutionFailed("rejected".into())),
            Mode::Panic => panic!("kaboom"),
            Mode::Sink => {
                self.journal.record(node, &msg);
                Ok(())
            }
            Mode::Complain => {
                self.journal.record(node, &msg);
                node.error("complaint", Some(&msg));
                Ok(())
            }
            _ => {
                let mut msg = msg;
                if let Some(stamp) = &self.stamp {
                    msg.set("stamp", stamp.clone());
                }
                if let Some(creds) = node.credentials() {
                    msg.set("creds", Value::Object(creds.clone()));
                }
                self.journal.record(node, &msg);
                node.send(msg);
                Ok(())
            }
        }
    }
}

struct TestType {
    journal: Journal,
    mode: Mode,
}

impl NodeType for TestType {
    fn create(&self, node: &Arc<Node>, config: &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError> {
        self.journal.created_node(node);
        let journal = self.journal.clone();
        let key = Journal::key(node);
        match self.mode {
            Mode::SlowClose => node.on_close(CloseHandler::asynchronous(move || {
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    journal.closed_node(key);
                    Ok(())
                }
                .boxed()
            })),
            Mode::PanicClose => node.on_close(CloseHandler::asynchronous(move || {
                async move {
                    journal.closed_node(key);
                    wedged().await
                }
                .boxed()
            })),
            Mode::BadClose => node.on_close(CloseHandler::sync(move || {
                journal.closed_node(key);
                Err(NodeError::CloseFailed("port stuck".into()))
            })),
            _ => node.on_close(CloseHandler::sync(move || {
                journal.closed_node(key);
                Ok(())
            })),
        }
        Ok(Box::new(TestNode {
            journal: self.journal.clone(),
            mode: self.mode,
            stamp: config.prop("stamp").cloned(),
        }))
    }
}

async fn wedged() -> Result<(), NodeError> {
    panic!("close boom")
}

/// Registers the test types:
/// `rec` records and forwards (adding its `stamp` prop and credentials),
/// `sink` records, `fail` and `boom` reject input, `complain` reports the
/// message it got as an error, `slow-close`, `bad-close` and `panic-close`
/// exercise teardown, `bad-ctor` never constructs and `config` is an inert
/// shared-config node.
pub(crate) fn register_test_types(registry: &TypeRegistry, journal: &Journal) {
    let types = [
        ("rec", Mode::Record),
        ("sink", Mode::Sink),
        ("fail", Mode::Fail),
        ("boom", Mode::Panic),
        ("slow-close", Mode::SlowClose),
        ("bad-close", Mode::BadClose),
        ("panic-close", Mode::PanicClose),
        ("complain", Mode::Complain),
        ("config", Mode::Sink),
    ];
    for (name, mode) in types {
        registry
            .register(name, Arc::new(TestType { journal: journal.clone(), mode }), RegisterOptions::module("test"))
            .unwrap();
    }
    let bad_ctor = |_: &Arc<Node>, _: &NodeDescriptor| -> Result<Box<dyn NodeBehavior>, NodeError> {
        Err(NodeError::InvalidConfig("missing broker".into()))
    };
    registry.register("bad-ctor", Arc::new(bad_ctor), RegisterOptions::module("test")).unwrap();
    registry.register("pass", Arc::new(Passthrough), RegisterOptions::default()).unwrap();
}

/// Messages seen by one recording node.
pub(crate) struct Recorder {
    journal: Journal,
    key: String,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.journal.received(&self.key)
    }

    pub fn take(&self) -> Vec<Seen> {
        self.journal.take(&self.key)
    }
}

/// A runtime wired to in-memory collaborators with the test types loaded.
pub(crate) struct TestBed {
    pub runtime: Arc<Runtime>,
    pub comms: Arc<RetainedComms>,
    pub storage: Arc<MemoryStorage>,
    pub journal: Journal,
    logger: Arc<MemoryLogger>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    pub fn with_storage(storage: Arc<MemoryStorage>) -> Self {
        let credentials = Arc::new(CredentialStore::new(storage.clone()));
        let registry = Arc::new(TypeRegistry::new(
            Some(Settings(MemorySettings::new())),
            Some(credentials.clone()),
        ));
        let journal = Journal::default();
        register_builtins(&registry);
        register_test_types(&registry, &journal);
        let comms = RetainedComms::new();
        let logger = Arc::new(MemoryLogger::default());
        let runtime = Runtime::new(registry, credentials, Comms(comms.clone()), Logger(logger.clone()));
        Self { runtime, comms, storage, journal, logger }
    }

    /// A forwarding node placed straight into the routing directory.
    pub fn spawn<I, O, S>(&self, id: &str, wires: I) -> Arc<Node>
    where
        I: IntoIterator<Item = O>,
        O: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.make(NodeDescriptor::new(id, "pass").with_wires(wires))
    }

    pub fn recorder(&self, id: &str) -> Recorder {
        self.make(NodeDescriptor::new(id, "sink"));
        Recorder { journal: self.journal.clone(), key: id.to_string() }
    }

    pub fn panicking(&self, id: &str) -> Arc<Node> {
        self.make(NodeDescriptor::new(id, "boom"))
    }

    pub fn failing(&self, id: &str) -> Arc<Node> {
        self.make(NodeDescriptor::new(id, "fail"))
    }

    pub fn make(&self, desc: NodeDescriptor) -> Arc<Node> {
        let node = Node::new(&desc, None, Arc::downgrade(&self.runtime));
        let factory = self.runtime.registry().get(&desc.type_name).unwrap();
        node.set_behavior(factory.create(&node, &desc).unwrap());
        self.runtime.insert_node(node.clone());
        node
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logger.records.lock().clone()
    }

    pub fn errors(&self) -> Vec<LogRecord> {
        self.logs().into_iter().filter(|r| r.level == LogLevel::Error).collect()
    }
}
