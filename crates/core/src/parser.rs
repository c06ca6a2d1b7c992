//! Default parser from a source configuration document to view specs.
//!
//! Expected shape:
//!
//! ```json
//! {
//!   "views": [
//!     { "dimensions": { "metric": "deaths" }, "dependencies": [123, "gdp"] },
//!     { "dependencies": [456] }
//!   ]
//! }
//! ```
//!
//! Structural problems (the document or a view entry is not an object) make
//! the whole configuration invalid. Dependency references are taken as-is:
//! a reference that is not a string or an integer is kept in its JSON text
//! form so that the resolver reports it against its own variant instead of
//! rejecting the entire document.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::view::ViewSpec;

/// Parse `config` into one [`ViewSpec`] per entry of its `views` array.
///
/// A document without a `views` key describes zero variants.
pub fn parse_view_specs(config: &Value) -> DomainResult<Vec<ViewSpec>> {
    let Some(object) = config.as_object() else {
        return Err(DomainError::invalid_config("configuration must be a JSON object"));
    };

    let views = match object.get("views") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(views)) => views,
        Some(_) => return Err(DomainError::invalid_config("`views` must be an array")),
    };

    views
        .iter()
        .enumerate()
        .map(|(index, entry)| parse_view(index, entry))
        .collect()
}

fn parse_view(index: usize, entry: &Value) -> DomainResult<ViewSpec> {
    let variant_index = u32::try_from(index)
        .map_err(|_| DomainError::invalid_config("too many views"))?;
    let Some(entry) = entry.as_object() else {
        return Err(DomainError::invalid_config(format!(
            "views[{index}] must be an object"
        )));
    };

    let mut dimensions = BTreeMap::new();
    match entry.get("dimensions") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, choice) in map {
                let choice = match choice {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(DomainError::invalid_config(format!(
                            "views[{index}].dimensions.{name} must be a scalar"
                        )));
                    }
                };
                dimensions.insert(name.clone(), choice);
            }
        }
        Some(_) => {
            return Err(DomainError::invalid_config(format!(
                "views[{index}].dimensions must be an object"
            )));
        }
    }

    let mut dependency_ids: Vec<String> = Vec::new();
    match entry.get("dependencies") {
        None | Some(Value::Null) => {}
        Some(Value::Array(refs)) => {
            for reference in refs {
                let id = match reference {
                    Value::String(s) => s.clone(),
                    Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
                    other => other.to_string(),
                };
                if !dependency_ids.contains(&id) {
                    dependency_ids.push(id);
                }
            }
        }
        Some(_) => {
            return Err(DomainError::invalid_config(format!(
                "views[{index}].dependencies must be an array"
            )));
        }
    }

    Ok(ViewSpec {
        variant_index,
        dimensions,
        dependency_ids,
    })
}
