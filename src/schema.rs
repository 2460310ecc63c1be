use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use serde_json::Value;

use crate::descriptor::NodeDescriptor;

/// JSON Schema of a deployable flow file: a list of node descriptors.
pub fn descriptor_schema() -> Value {
    let schema = schema_for!(Vec<NodeDescriptor>);
    serde_json::to_value(&schema).unwrap_or(Value::Null)
}

/// Writes `flow.schema.json` into `out_dir`, creating it if needed.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir)?;
    let json = serde_json::to_string_pretty(&descriptor_schema())?;
    fs::write(out_dir.join("flow.schema.json"), json)?;
    Ok(())
}
