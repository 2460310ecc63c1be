use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A live request/response handle carried by a message.
///
/// It is never deep-copied: every clone of the message shares the same
/// underlying transaction.
#[derive(Clone)]
pub struct Exchange(Arc<dyn Any + Send + Sync>);

impl Exchange {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Exchange(..)")
    }
}

/// The unit of data flowing along wires.
///
/// `Clone` is the structural deep copy used for fan-out: the body is
/// copied, the correlation id is kept verbatim and the exchange handle is
/// shared by reference.
#[derive(Debug, Clone, Default)]
pub struct Message {
    id: Option<String>,
    body: Box<Map<String, Value>>,
    exchange: Option<Exchange>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: Value) -> Self {
        let mut msg = Self::new();
        msg.set("payload", payload);
        msg
    }

    /// Builds a message from a JSON object. `_msgid` is lifted out of the
    /// body; non-object values become the `payload`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                let id = match map.remove("_msgid") {
                    Some(Value::String(s)) => Some(s),
                    _ => None,
                };
                Self { id, body: Box::new(map), exchange: None }
            }
            other => Self::with_payload(other),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = (*self.body).clone();
        if let Some(id) = &self.id {
            map.insert("_msgid".into(), Value::String(id.clone()));
        }
        Value::Object(map)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Assigns a fresh correlation id if none is present and returns it.
    pub fn ensure_id(&mut self) -> &str {
        self.id
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .as_str()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.body.get("payload")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.body.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.body
    }

    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    pub fn set_exchange(&mut self, exchange: Exchange) {
        self.exchange = Some(exchange);
    }

    #[cfg(test)]
    pub(crate) fn body_ptr(&self) -> *const Map<String, Value> {
        &*self.body as *const _
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.body.len() + usize::from(self.id.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(id) = &self.id {
            map.serialize_entry("_msgid", id)?;
        }
        for (k, v) in self.body.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_value(Value::Object(map)))
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}
