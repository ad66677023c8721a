//! Serialized graph documents and version migration.
//!
//! Only the current schema has a Rust type. Older documents are upgraded
//! as untyped JSON values, one version step at a time, before decoding.

use serde_json::{Map, Value};

use super::exec_graph::ExecGraph;
use crate::errors::GraphError;

/// Version written by this crate.
pub const CURRENT_GRAPH_VERSION: u32 = 2;

/// Text encoding of a graph document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// JSON.
    Json,
    /// YAML.
    Yaml,
}

/// Decodes a graph document of any supported version.
pub fn decode_graph(text: &str, format: DocumentFormat) -> Result<ExecGraph, GraphError> {
    let value: Value = match format {
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| GraphError::Schema(e.to_string()))?,
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| GraphError::Schema(e.to_string()))?,
    };
    let version = document_version(&value)?;
    let upgraded = migrate(value, version)?;
    serde_json::from_value(upgraded).map_err(|e| GraphError::Schema(e.to_string()))
}

/// Encodes a graph in the current schema.
pub fn encode_graph(graph: &ExecGraph, format: DocumentFormat) -> Result<String, GraphError> {
    match format {
        DocumentFormat::Json => serde_json::to_string_pretty(graph).map_err(|e| GraphError::Schema(e.to_string())),
        DocumentFormat::Yaml => serde_yaml::to_string(graph).map_err(|e| GraphError::Schema(e.to_string())),
    }
}

fn document_version(value: &Value) -> Result<u32, GraphError> {
    match value.get("version") {
        None => Ok(CURRENT_GRAPH_VERSION),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| GraphError::Schema(format!("invalid version field: {v}"))),
    }
}

/// Upgrades a document stored at `version` to [`CURRENT_GRAPH_VERSION`].
pub fn migrate(mut value: Value, version: u32) -> Result<Value, GraphError> {
    if version == 0 || version > CURRENT_GRAPH_VERSION {
        return Err(GraphError::Schema(format!(
            "unsupported graph version {version}, expected 1..={CURRENT_GRAPH_VERSION}"
        )));
    }
    let mut current = version;
    while current < CURRENT_GRAPH_VERSION {
        value = match current {
            1 => v1_to_v2(value)?,
            other => return Err(GraphError::Schema(format!("no migration from version {other}"))),
        };
        current += 1;
    }
    if let Some(obj) = value.as_object_mut() {
        obj.insert("version".to_string(), Value::from(CURRENT_GRAPH_VERSION));
    }
    Ok(value)
}

/// v1 named the node key `process_code` and the function `snippet`, and had
/// no edge list: each process consumed the one declared before it.
fn v1_to_v2(value: Value) -> Result<Value, GraphError> {
    let Value::Object(mut doc) = value else {
        return Err(GraphError::Schema("graph document must be an object".into()));
    };

    let processes = match doc.remove("processes") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(GraphError::Schema("'processes' must be a list".into())),
        None => Vec::new(),
    };

    let mut upgraded = Vec::with_capacity(processes.len());
    for item in processes {
        let Value::Object(mut process) = item else {
            return Err(GraphError::Schema("process entries must be objects".into()));
        };
        rename(&mut process, "process_code", "code");
        rename(&mut process, "snippet", "function");
        rename(&mut process, "pre_snippets", "pre_functions");
        rename(&mut process, "post_snippets", "post_functions");
        upgraded.push(Value::Object(process));
    }

    if !doc.contains_key("edges") {
        let mut edges = Vec::new();
        for pair in upgraded.windows(2) {
            let consumer_has_inputs = pair[1]
                .get("inputs")
                .and_then(Value::as_array)
                .is_some_and(|inputs| !inputs.is_empty());
            if let (Some(from), Some(to), true) = (
                pair[0].get("code").and_then(Value::as_str),
                pair[1].get("code").and_then(Value::as_str),
                consumer_has_inputs,
            ) {
                edges.push(serde_json::json!({ "from": from, "to": to }));
            }
        }
        doc.insert("edges".to_string(), Value::Array(edges));
    }

    doc.insert("processes".to_string(), Value::Array(upgraded));
    Ok(Value::Object(doc))
}

fn rename(obj: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(v) = obj.remove(from) {
        obj.insert(to.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ProcessDef, VariableDecl};
    use pretty_assertions::assert_eq;

    const V1_YAML: &str = r"
version: 1
processes:
  - process_code: fetch
    snippet:
      code: fn.fetch
    outputs:
      - name: page
  - process_code: parse
    snippet:
      code: fn.parse
      params: strict
    inputs:
      - name: page
";

    #[test]
    fn test_v1_document_is_upgraded() {
        let graph = decode_graph(V1_YAML, DocumentFormat::Yaml).unwrap();
        assert_eq!(graph.version, CURRENT_GRAPH_VERSION);
        assert_eq!(graph.processes[1].code, "parse");
        assert_eq!(graph.processes[1].function.params.as_deref(), Some("strict"));
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, "fetch");
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_current_document_roundtrip() {
        let graph = ExecGraph::new()
            .with_process(ProcessDef::new("a", "fn.a").with_output(VariableDecl::local("x")))
            .with_process(ProcessDef::new("b", "fn.b").with_input(VariableDecl::local("x")))
            .with_edge("a", "b");
        for format in [DocumentFormat::Json, DocumentFormat::Yaml] {
            let text = encode_graph(&graph, format).unwrap();
            assert_eq!(decode_graph(&text, format).unwrap(), graph);
        }
    }

    #[test]
    fn test_future_version_is_rejected() {
        let err = decode_graph(r#"{"version": 9, "processes": []}"#, DocumentFormat::Json).unwrap_err();
        assert!(matches!(err, GraphError::Schema(_)));
        assert_eq!(err.error_info().code, "GRAPH-006-SCHEMA");
    }
}
