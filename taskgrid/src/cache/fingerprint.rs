//! Cache keys.
//!
//! The fingerprint is the hex SHA-256 of a canonical JSON document built
//! from the process code, its function reference and the resolved inputs in
//! declaration order. Variable inputs contribute their content identity, so
//! two runs that feed identical bytes produce identical fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::errors::TaskgridError;
use crate::graph::{FunctionRef, ProcessDef};
use crate::storage::ContentIdentity;

/// What one resolved input contributes to the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputFingerprint {
    /// A single variable.
    Content(ContentIdentity),
    /// Array input; `None` marks a nullified element.
    Contents(Vec<Option<ContentIdentity>>),
    /// Inline literal.
    Inline(String),
    /// Inline literal excluded by `omit_inline`.
    InlineOmitted,
    /// Absent nullable input.
    Null,
}

#[derive(Serialize)]
struct Canonical<'a> {
    process: &'a str,
    function: &'a str,
    params: Option<&'a str>,
    inputs: Vec<(&'a str, &'a InputFingerprint)>,
    inline: Option<&'a BTreeMap<String, String>>,
}

/// Identity of the computation: function code and its params.
#[must_use]
pub fn process_identity(function: &FunctionRef) -> String {
    match function.params.as_deref() {
        Some(params) => format!("{}:{}", function.code, params),
        None => function.code.clone(),
    }
}

/// Computes the fingerprint of a task about to be produced.
///
/// `inputs` must be in declaration order. When the process cache policy has
/// `omit_inline`, inline literals must already be
/// [`InputFingerprint::InlineOmitted`] and `inline` is ignored.
///
/// # Errors
///
/// [`TaskgridError::Serialization`] if the canonical document cannot be
/// encoded.
pub fn compute_fingerprint(
    process: &ProcessDef,
    inputs: &[(String, InputFingerprint)],
    inline: &BTreeMap<String, String>,
) -> Result<String, TaskgridError> {
    let canonical = Canonical {
        process: &process.code,
        function: &process.function.code,
        params: process.function.params.as_deref(),
        inputs: inputs.iter().map(|(name, fp)| (name.as_str(), fp)).collect(),
        inline: (!process.cache.omit_inline).then_some(inline),
    };
    let json = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VariableDecl;

    fn process(omit_inline: bool) -> ProcessDef {
        ProcessDef::new("resize", "fn.resize")
            .with_input(VariableDecl::local("image"))
            .with_input(VariableDecl::local("width"))
            .with_cache(omit_inline)
    }

    fn inputs(bytes: &[u8], width: &str, omit: bool) -> Vec<(String, InputFingerprint)> {
        vec![
            ("image".into(), InputFingerprint::Content(ContentIdentity::of(bytes))),
            (
                "width".into(),
                if omit {
                    InputFingerprint::InlineOmitted
                } else {
                    InputFingerprint::Inline(width.into())
                },
            ),
        ]
    }

    #[test]
    fn test_identical_inputs_match() {
        let p = process(false);
        let inline = BTreeMap::new();
        let a = compute_fingerprint(&p, &inputs(b"img", "640", false), &inline).unwrap();
        let b = compute_fingerprint(&p, &inputs(b"img", "640", false), &inline).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_and_inline_change_fingerprint() {
        let p = process(false);
        let inline = BTreeMap::new();
        let base = compute_fingerprint(&p, &inputs(b"img", "640", false), &inline).unwrap();
        assert_ne!(base, compute_fingerprint(&p, &inputs(b"img2", "640", false), &inline).unwrap());
        assert_ne!(base, compute_fingerprint(&p, &inputs(b"img", "800", false), &inline).unwrap());
    }

    #[test]
    fn test_omit_inline_ignores_literals() {
        let p = process(true);
        let a = compute_fingerprint(
            &p,
            &inputs(b"img", "640", true),
            &BTreeMap::from([("run".to_string(), "a".to_string())]),
        )
        .unwrap();
        let b = compute_fingerprint(
            &p,
            &inputs(b"img", "800", true),
            &BTreeMap::from([("run".to_string(), "b".to_string())]),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_hashes_canonical_document() {
        let p = process(false);
        let inline = BTreeMap::from([("width".to_string(), "640".to_string())]);
        let fingerprint = compute_fingerprint(&p, &inputs(b"img", "640", false), &inline).unwrap();
        let empty = hex::encode(Sha256::digest(b""));
        assert_ne!(fingerprint, empty);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_process_identity() {
        assert_eq!(process_identity(&FunctionRef::new("fn.a")), "fn.a");
        assert_eq!(process_identity(&FunctionRef::new("fn.a").with_params("x=1")), "fn.a:x=1");
    }
}
