use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TAB_TYPE: &str = "tab";
pub const SUBFLOW_TYPE: &str = "subflow";
pub const SUBFLOW_PREFIX: &str = "subflow:";

/// Keys ignored when deciding whether a node's properties changed.
const LAYOUT_KEYS: [&str; 3] = ["x", "y", "wires"];
/// Keys never treated as references to other nodes.
const NON_REFERENCE_KEYS: [&str; 5] = ["id", "z", "wires", "type", "_alias"];

/// One entry of a deployed flow file.
///
/// Anything besides the well-known keys lands in `props` so node types can
/// read their own configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owning tab or subflow template. Absent means global scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, Value>>,
    /// Template node id this node was cloned from inside a subflow instance.
    #[serde(rename = "_alias", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            name: None,
            z: None,
            wires: Vec::new(),
            credentials: None,
            alias: None,
            props: Map::new(),
        }
    }

    pub fn with_z(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_wires<I, O, S>(mut self, wires: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wires = wires
            .into_iter()
            .map(|port| port.into_iter().map(Into::into).collect())
            .collect();
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_credentials(mut self, credentials: Map<String, Value>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn is_tab(&self) -> bool {
        self.type_name == TAB_TYPE
    }

    pub fn is_subflow_template(&self) -> bool {
        self.type_name == SUBFLOW_TYPE
    }

    /// Template id for a `subflow:<id>` usage site.
    pub fn subflow_template_id(&self) -> Option<&str> {
        self.type_name.strip_prefix(SUBFLOW_PREFIX)
    }

    /// Id used for credential lookup: the template node for subflow clones.
    pub fn credential_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// String-valued top-level properties, any of which may name another node.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.props
            .iter()
            .filter(|(k, _)| !NON_REFERENCE_KEYS.contains(&k.as_str()))
            .filter_map(|(_, v)| v.as_str())
    }

    /// True when any property other than position or wiring differs.
    pub fn properties_differ(&self, other: &NodeDescriptor) -> bool {
        comparable(self) != comparable(other)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn comparable(node: &NodeDescriptor) -> Map<String, Value> {
    let mut map = match node.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for key in LAYOUT_KEYS {
        map.remove(key);
    }
    map
}

/// One boundary port of a subflow template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubflowPort {
    #[serde(default)]
    pub wires: Vec<PortWire>,
}

/// `port` is only meaningful on output ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PortWire {
    pub id: String,
    #[serde(default)]
    pub port: usize,
}

/// Reads the `in`/`out` port lists of a subflow template descriptor.
pub fn subflow_ports(template: &NodeDescriptor, key: &str) -> Vec<SubflowPort> {
    template
        .prop(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
