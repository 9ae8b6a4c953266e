//! Schema inference from a declared feature spec.
//!
//! The semantic kind of a feature only selects which default policies apply
//! and which output type a resampled column is coerced to.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Semantic kind of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Integer,
    Float,
    Categorical,
    /// No default policy applies; only explicit overrides do.
    Unsupported,
}

impl FeatureKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FeatureKind::Integer | FeatureKind::Float)
    }

    /// Key used for this kind in policy tables.
    pub fn table_key(self) -> Option<&'static str> {
        match self {
            FeatureKind::Integer => Some("integer"),
            FeatureKind::Float => Some("float"),
            FeatureKind::Categorical => Some("categorical"),
            FeatureKind::Unsupported => None,
        }
    }

    /// Inverse of [`FeatureKind::table_key`].
    pub fn from_table_key(key: &str) -> Option<Self> {
        match key {
            "integer" => Some(FeatureKind::Integer),
            "float" => Some(FeatureKind::Float),
            "categorical" => Some(FeatureKind::Categorical),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::Integer => write!(f, "integer"),
            FeatureKind::Float => write!(f, "float"),
            FeatureKind::Categorical => write!(f, "categorical"),
            FeatureKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// A declared feature, either as a bare dtype or with extra attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeclaredFeature {
    Dtype(String),
    Detailed {
        dtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shape: Option<Vec<usize>>,
    },
}

impl DeclaredFeature {
    pub fn dtype(&self) -> &str {
        match self {
            DeclaredFeature::Dtype(d) => d,
            DeclaredFeature::Detailed { dtype, .. } => dtype,
        }
    }
}

/// Declared feature spec: feature name to declared type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSpec {
    features: BTreeMap<String, DeclaredFeature>,
}

impl FeatureSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, dtype: impl Into<String>) -> Self {
        self.features
            .insert(name.into(), DeclaredFeature::Dtype(dtype.into()));
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a feature spec from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeclaredFeature)> {
        self.features.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Classify a declared dtype.
pub fn classify(dtype: &str) -> FeatureKind {
    let normalized = dtype.trim().to_ascii_lowercase();
    let normalized = normalized.strip_prefix("tf.").unwrap_or(&normalized);

    match normalized {
        "int" | "integer" | "int8" | "int16" | "int32" | "int64" | "uint8" | "uint16"
        | "uint32" | "uint64" | "long" => FeatureKind::Integer,
        "float" | "float16" | "float32" | "float64" | "double" | "bfloat16" | "half" => {
            FeatureKind::Float
        }
        "bool" | "boolean" | "string" | "str" | "bytes" | "utf8" | "text" | "category"
        | "categorical" => FeatureKind::Categorical,
        _ => FeatureKind::Unsupported,
    }
}

/// Inferred semantic schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    kinds: BTreeMap<String, FeatureKind>,
}

impl Schema {
    pub fn kind(&self, feature: &str) -> Option<FeatureKind> {
        self.kinds.get(feature).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FeatureKind)> {
        self.kinds.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.kinds.contains_key(feature)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl FromIterator<(String, FeatureKind)> for Schema {
    fn from_iter<I: IntoIterator<Item = (String, FeatureKind)>>(iter: I) -> Self {
        Self {
            kinds: iter.into_iter().collect(),
        }
    }
}

/// Classify every declared feature.
pub fn infer_schema(spec: &FeatureSpec) -> Schema {
    spec.iter()
        .map(|(name, declared)| (name.to_string(), classify(declared.dtype())))
        .collect()
}
