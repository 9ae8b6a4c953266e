//! Per-feature policy resolution.
//!
//! Overrides are keyed either by feature name or by a type key (`integer`,
//! `float`, `categorical`). For every feature and stage the first match in
//! this order wins:
//!
//! 1. per-feature override
//! 2. type-level override
//! 3. default table entry for the feature's type

use crate::core::methods::{FillMethod, MethodRegistry, MethodSpec, OutputType, ResampleMethod};
use crate::core::schema::{FeatureKind, Schema};
use crate::error::{PolicyStage, Result, SequencerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Resampling and filling entries for one feature or type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resampling: Option<Vec<MethodSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filling: Option<Vec<MethodSpec>>,
}

impl PolicyEntry {
    pub fn resample(mut self, spec: MethodSpec) -> Self {
        self.resampling.get_or_insert_with(Vec::new).push(spec);
        self
    }

    pub fn fill(mut self, spec: MethodSpec) -> Self {
        self.filling.get_or_insert_with(Vec::new).push(spec);
        self
    }

    pub fn stage(&self, stage: PolicyStage) -> Option<&Vec<MethodSpec>> {
        match stage {
            PolicyStage::Resampling => self.resampling.as_ref(),
            PolicyStage::Filling => self.filling.as_ref(),
        }
    }
}

/// Policy entries keyed by feature name or type key.
pub type PolicyTable = BTreeMap<String, PolicyEntry>;

/// Built-in default table, keyed by type.
pub fn default_table() -> PolicyTable {
    let numeric = || {
        PolicyEntry::default()
            .resample(MethodSpec::new("mean"))
            .fill(MethodSpec::new("forward"))
    };

    let mut table = PolicyTable::new();
    table.insert("integer".to_string(), numeric());
    table.insert("float".to_string(), numeric());
    table.insert(
        "categorical".to_string(),
        PolicyEntry::default()
            .resample(MethodSpec::new("mode"))
            .fill(MethodSpec::new("forward")),
    );
    table
}

/// Whether an override key addresses a type rather than a feature.
fn is_type_key(key: &str, schema: &Schema) -> bool {
    FeatureKind::from_table_key(key).is_some() && !schema.contains(key)
}

/// Resolve the method entries of one stage for every feature.
///
/// The feature universe is every declared feature plus every override key
/// that is not a type key. Features in `excluded` are skipped. Features with
/// nothing to resolve are absent from the result.
pub fn fill_defaults(
    stage: PolicyStage,
    overrides: &PolicyTable,
    defaults: &PolicyTable,
    schema: &Schema,
    excluded: &[&str],
) -> BTreeMap<String, Vec<MethodSpec>> {
    let features: BTreeSet<&str> = schema
        .iter()
        .map(|(name, _)| name)
        .chain(
            overrides
                .keys()
                .map(String::as_str)
                .filter(|k| !is_type_key(k, schema)),
        )
        .filter(|name| !excluded.contains(name))
        .collect();

    let mut resolved = BTreeMap::new();
    for feature in features {
        let type_key = schema.kind(feature).and_then(FeatureKind::table_key);

        let entries = overrides
            .get(feature)
            .and_then(|e| e.stage(stage))
            .or_else(|| {
                type_key
                    .and_then(|k| overrides.get(k))
                    .and_then(|e| e.stage(stage))
            })
            .or_else(|| {
                type_key
                    .and_then(|k| defaults.get(k))
                    .and_then(|e| e.stage(stage))
            });

        if let Some(entries) = entries {
            resolved.insert(feature.to_string(), entries.clone());
        }
    }
    resolved
}

/// Map every resolved entry list to registry functions.
pub fn get_function_dict<F>(
    config: &BTreeMap<String, Vec<MethodSpec>>,
    build: impl Fn(&MethodSpec) -> Result<F>,
) -> Result<BTreeMap<String, Vec<F>>> {
    config
        .iter()
        .map(|(feature, specs)| {
            let functions = specs.iter().map(&build).collect::<Result<Vec<F>>>()?;
            Ok((feature.clone(), functions))
        })
        .collect()
}

/// The resolved policy of one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePolicy {
    pub kind: Option<FeatureKind>,
    pub resample: ResampleMethod,
    pub output: OutputType,
    pub fill: Option<FillMethod>,
}

/// Immutable, validated policies for every resampled feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedPolicies {
    features: BTreeMap<String, FeaturePolicy>,
}

impl ResolvedPolicies {
    /// Resolve and validate all policies.
    ///
    /// Fails if any feature resolves to anything but exactly one resampling
    /// function, to more than one filling function, or to a method that
    /// cannot handle the feature's type.
    pub fn resolve(
        overrides: &PolicyTable,
        defaults: &PolicyTable,
        schema: &Schema,
        excluded: &[&str],
    ) -> Result<Self> {
        let r_config = fill_defaults(PolicyStage::Resampling, overrides, defaults, schema, excluded);
        let resample_functions = get_function_dict(&r_config, MethodRegistry::resampler)?;

        let f_config = fill_defaults(PolicyStage::Filling, overrides, defaults, schema, excluded);
        let mut filling_functions = get_function_dict(&f_config, MethodRegistry::filler)?;

        let mut features = BTreeMap::new();
        for (feature, mut functions) in resample_functions {
            let kind = schema.kind(&feature);

            let resample = match functions.len() {
                1 => functions.remove(0),
                0 => {
                    return Err(SequencerError::MissingPolicy {
                        stage: PolicyStage::Resampling,
                        feature,
                    })
                }
                count => {
                    return Err(SequencerError::AmbiguousPolicy {
                        stage: PolicyStage::Resampling,
                        feature,
                        count,
                    })
                }
            };
            if !resample.applies_to(kind) {
                return Err(inapplicable(resample.name(), kind, &feature));
            }
            let output = resample.output_type(kind);

            let mut fills = filling_functions.remove(&feature).unwrap_or_default();
            let fill = match fills.len() {
                0 => None,
                1 => Some(fills.remove(0)),
                count => {
                    return Err(SequencerError::AmbiguousPolicy {
                        stage: PolicyStage::Filling,
                        feature,
                        count,
                    })
                }
            };
            let fill = match fill {
                Some(method) if !method.applies_to(kind) => {
                    return Err(inapplicable(method.name(), kind, &feature));
                }
                // The mean of an integer column is generally fractional.
                Some(FillMethod::Mean) if output == OutputType::Integer => {
                    return Err(SequencerError::InapplicableMethod {
                        method: "mean".to_string(),
                        kind: "integer-valued".to_string(),
                        feature,
                    });
                }
                Some(FillMethod::Custom(value)) => {
                    let value = output.coerce(value, &feature).map_err(|e| {
                        SequencerError::InvalidParameter {
                            method: "custom".to_string(),
                            name: "custom_value".to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    Some(FillMethod::Custom(value))
                }
                other => other,
            };

            features.insert(
                feature,
                FeaturePolicy {
                    kind,
                    resample,
                    output,
                    fill,
                },
            );
        }

        for feature in filling_functions.keys() {
            debug!(feature = %feature, "Filling policy without a resampling policy ignored");
        }

        Ok(Self { features })
    }

    pub fn get(&self, feature: &str) -> Option<&FeaturePolicy> {
        self.features.get(feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeaturePolicy)> {
        self.features.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn inapplicable(method: &str, kind: Option<FeatureKind>, feature: &str) -> SequencerError {
    SequencerError::InapplicableMethod {
        method: method.to_string(),
        kind: kind.map_or_else(|| "undeclared".to_string(), |k| k.to_string()),
        feature: feature.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{infer_schema, FeatureSpec};
    use crate::event::Value;
    use serde_json::json;

    fn schema() -> Schema {
        infer_schema(
            &FeatureSpec::new()
                .with("ts", "string")
                .with("speed", "float32")
                .with("rpm", "float32")
                .with("gear", "int64")
                .with("mode", "string")
                .with("blob", "complex64"),
        )
    }

    #[test]
    fn test_defaults_by_type() {
        let policies =
            ResolvedPolicies::resolve(&PolicyTable::new(), &default_table(), &schema(), &["ts"])
                .unwrap();

        assert_eq!(policies.get("speed").unwrap().resample, ResampleMethod::Mean);
        assert_eq!(policies.get("gear").unwrap().output, OutputType::Float);
        assert_eq!(policies.get("mode").unwrap().resample, ResampleMethod::Mode);
        assert_eq!(policies.get("mode").unwrap().fill, Some(FillMethod::Forward));
        // No defaults for unsupported types, and excluded columns stay out.
        assert!(policies.get("blob").is_none());
        assert!(policies.get("ts").is_none());
    }

    #[test]
    fn test_override_precedence() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "float".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("max")),
        );
        overrides.insert(
            "speed".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("median")),
        );

        let policies =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap();

        // Feature override beats type override beats default.
        assert_eq!(policies.get("speed").unwrap().resample, ResampleMethod::Median);
        assert_eq!(policies.get("rpm").unwrap().resample, ResampleMethod::Max);
        assert_eq!(policies.get("gear").unwrap().resample, ResampleMethod::Mean);
        // Filling was not overridden anywhere, so the default still applies.
        assert_eq!(policies.get("speed").unwrap().fill, Some(FillMethod::Forward));
    }

    #[test]
    fn test_multiple_resampling_functions_are_rejected() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "speed".to_string(),
            PolicyEntry::default()
                .resample(MethodSpec::new("mean"))
                .resample(MethodSpec::new("max")),
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::AmbiguousPolicy {
                stage: PolicyStage::Resampling,
                count: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_multiple_filling_functions_are_rejected() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "gear".to_string(),
            PolicyEntry::default()
                .fill(MethodSpec::new("forward"))
                .fill(MethodSpec::new("backward")),
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::AmbiguousPolicy {
                stage: PolicyStage::Filling,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_resampling_list_is_rejected() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "gear".to_string(),
            PolicyEntry {
                resampling: Some(Vec::new()),
                filling: None,
            },
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(err, SequencerError::MissingPolicy { .. }));
    }

    #[test]
    fn test_numeric_method_on_categorical_is_rejected() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "mode".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("mean")),
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(err, SequencerError::InapplicableMethod { .. }));
    }

    #[test]
    fn test_override_only_feature_is_resolved() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "battery".to_string(),
            PolicyEntry::default()
                .resample(MethodSpec::new("last"))
                .fill(MethodSpec::new("custom").with_param("custom_value", json!(100))),
        );

        let policies =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap();
        let battery = policies.get("battery").unwrap();
        assert_eq!(battery.kind, None);
        assert_eq!(battery.fill, Some(FillMethod::Custom(Value::Int(100))));
    }

    #[test]
    fn test_custom_fill_value_is_coerced() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "speed".to_string(),
            PolicyEntry::default()
                .fill(MethodSpec::new("custom").with_param("custom_value", json!(0))),
        );
        overrides.insert(
            "gear".to_string(),
            PolicyEntry::default()
                .resample(MethodSpec::new("max"))
                .fill(MethodSpec::new("custom").with_param("custom_value", json!("neutral"))),
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(err, SequencerError::InvalidParameter { .. }));

        overrides.remove("gear");
        let policies =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap();
        assert_eq!(
            policies.get("speed").unwrap().fill,
            Some(FillMethod::Custom(Value::Float(0.0)))
        );
    }

    #[test]
    fn test_mean_fill_rejected_for_integer_output() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "gear".to_string(),
            PolicyEntry::default()
                .resample(MethodSpec::new("max"))
                .fill(MethodSpec::new("mean")),
        );

        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::InapplicableMethod { ref feature, .. } if feature == "gear"
        ));

        // A count over a float feature is integer-valued as well.
        overrides.insert(
            "gear".to_string(),
            PolicyEntry::default().fill(MethodSpec::new("mean")),
        );
        overrides.insert(
            "speed".to_string(),
            PolicyEntry::default()
                .resample(MethodSpec::new("count"))
                .fill(MethodSpec::new("mean")),
        );
        let err =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::InapplicableMethod { ref feature, .. } if feature == "speed"
        ));

        // Mean-resampled integers are float-valued, so mean filling is fine.
        overrides.remove("speed");
        let policies =
            ResolvedPolicies::resolve(&overrides, &default_table(), &schema(), &[]).unwrap();
        assert_eq!(policies.get("gear").unwrap().fill, Some(FillMethod::Mean));
    }
}
