use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

/// Outbound publish capability used by nodes for status updates.
pub trait CommsType: Send + Sync {
    fn publish(&self, topic: &str, data: Value, retain: bool);
}

#[derive(Clone)]
pub struct Comms(pub Arc<dyn CommsType>);

impl Comms {
    pub fn publish(&self, topic: &str, data: Value, retain: bool) {
        self.0.publish(topic, data, retain)
    }
}

impl fmt::Debug for Comms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comms")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsMessage {
    pub topic: String,
    pub data: Value,
}

struct Subscriber {
    pattern: String,
    tx: UnboundedSender<CommsMessage>,
}

/// In-process hub that remembers retained topics and replays them to late
/// subscribers.
#[derive(Default)]
pub struct RetainedComms {
    retained: DashMap<String, Value>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl RetainedComms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes to `pattern` (MQTT-style `+`/`#` wildcards). Every retained
    /// topic that matches is delivered first.
    pub fn subscribe(&self, pattern: &str) -> UnboundedReceiver<CommsMessage> {
        let (tx, rx) = unbounded_channel();
        for entry in self.retained.iter() {
            if topic_matches(pattern, entry.key()) {
                let _ = tx.send(CommsMessage { topic: entry.key().clone(), data: entry.value().clone() });
            }
        }
        self.subscribers.write().push(Subscriber { pattern: pattern.to_string(), tx });
        rx
    }

    pub fn retained(&self, topic: &str) -> Option<Value> {
        self.retained.get(topic).map(|v| v.clone())
    }
}

impl CommsType for RetainedComms {
    fn publish(&self, topic: &str, data: Value, retain: bool) {
        trace!(topic, retain, "publish");
        if retain {
            self.retained.insert(topic.to_string(), data.clone());
        }
        let mut closed = false;
        for sub in self.subscribers.read().iter() {
            if topic_matches(&sub.pattern, topic) {
                let msg = CommsMessage { topic: topic.to_string(), data: data.clone() };
                closed |= sub.tx.send(msg).is_err();
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
    }
}

impl fmt::Debug for RetainedComms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetainedComms({} retained)", self.retained.len())
    }
}

/// `+` matches exactly one level; a trailing `#` matches the parent level
/// and everything below it.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return pat.next().is_none(),
            (Some("+"), Some(level)) => {
                if level.is_empty() {
                    return false;
                }
            }
            (Some(p), Some(t)) => {
                if p != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
