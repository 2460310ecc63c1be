use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use std::env;

static ENV_VAR_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\((\S+)\)$").expect("static regex is valid"));

/// Fresh node id, e.g. `5f2c91a7.3e4d1b`.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    format!("{:08x}.{:x}", rng.random::<u32>(), rng.random_range(0x100000u32..0xffffff))
}

/// Replaces every string that is exactly `$(NAME)` with the value of the
/// environment variable `NAME`. Unset variables leave the string untouched.
pub fn map_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(name) = ENV_VAR_REF.captures(s).and_then(|c| c.get(1)) {
                if let Ok(resolved) = env::var(name.as_str()) {
                    *s = resolved;
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(map_env_vars),
        Value::Object(map) => map.values_mut().for_each(map_env_vars),
        _ => {}
    }
}

/// Output wiring comparison by content.
pub fn same_wires(a: &[Vec<String>], b: &[Vec<String>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}
