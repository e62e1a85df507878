use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;
use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::*;

pub const TARGET_FRAMES: usize = 100;
pub const INPUT_DIM: usize = 225;

/// Metadata key under which the checkpoint stores its label map, a JSON
/// object mapping label name to class index.
const LABEL_MAP_KEY: &str = "label_map";

#[derive(Clone)]
pub struct SignModel {
    plan: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    labels: HashMap<i64, String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub input_shape: Vec<usize>,
    pub num_classes: usize,
    pub labels: Vec<String>,
    pub version: String,
}

impl SignModel {
    pub fn load<P: AsRef<Path>>(model_path: P) -> TractResult<Self> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            anyhow::bail!("model artifact not found: {}", model_path.display());
        }

        let proto = tract_onnx::onnx().proto_model_for_path(model_path)?;
        let labels = label_map_from_proto(&proto)?;

        let plan = tract_onnx::onnx()
            .model_for_proto_model(&proto)?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, TARGET_FRAMES, INPUT_DIM)),
            )?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self { plan, labels })
    }

    /// Runs one forward pass over a flat (100 * 225) frame buffer and returns
    /// the arg-max class with its softmax probability.
    pub fn predict(&self, frames: &[f32]) -> TractResult<Prediction> {
        let input = Tensor::from_shape(&[1, TARGET_FRAMES, INPUT_DIM], frames)?;
        let outputs = self.plan.run(tvec!(input.into()))?;
        let logits: Vec<f32> = outputs[0].to_array_view::<f32>()?.iter().copied().collect();

        let probs = softmax(&logits);
        let (index, confidence) =
            argmax(&probs).ok_or_else(|| anyhow::anyhow!("model produced an empty output"))?;

        Ok(Prediction {
            label: label_for(&self.labels, index),
            confidence,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn info(&self) -> ModelInfo {
        let mut entries: Vec<(&i64, &String)> = self.labels.iter().collect();
        entries.sort_by_key(|(index, _)| **index);
        ModelInfo {
            input_shape: vec![TARGET_FRAMES, INPUT_DIM],
            num_classes: self.labels.len(),
            labels: entries.into_iter().map(|(_, name)| name.clone()).collect(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn label_map_from_proto(proto: &ModelProto) -> TractResult<HashMap<i64, String>> {
    let entry = proto
        .metadata_props
        .iter()
        .find(|prop| prop.key == LABEL_MAP_KEY)
        .ok_or_else(|| anyhow::anyhow!("checkpoint has no {} metadata entry", LABEL_MAP_KEY))?;
    let name_to_index: HashMap<String, i64> = serde_json::from_str(&entry.value)
        .map_err(|e| anyhow::anyhow!("{} metadata is not a valid label map: {}", LABEL_MAP_KEY, e))?;
    // the checkpoint maps name -> index; lookups at inference time go the other way
    Ok(name_to_index
        .into_iter()
        .map(|(name, index)| (index, name))
        .collect())
}

fn label_for(labels: &HashMap<i64, String>, index: usize) -> String {
    labels
        .get(&(index as i64))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    // shift by the max logit so exp() cannot overflow
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tract_onnx::pb::StringStringEntryProto;

    fn proto_with_label_map(value: &str) -> ModelProto {
        ModelProto {
            metadata_props: vec![StringStringEntryProto {
                key: LABEL_MAP_KEY.to_string(),
                value: value.to_string(),
            }],
            ..ModelProto::default()
        }
    }

    #[test]
    fn label_map_is_inverted_at_load() {
        let proto = proto_with_label_map(r#"{"hello": 0, "thanks": 1, "love": 2}"#);
        let labels = label_map_from_proto(&proto).unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[&0], "hello");
        assert_eq!(labels[&1], "thanks");
        assert_eq!(labels[&2], "love");
    }

    #[test]
    fn missing_label_map_metadata_is_an_error() {
        let err = label_map_from_proto(&ModelProto::default()).unwrap_err();
        assert!(err.to_string().contains("label_map"));
    }

    #[test]
    fn malformed_label_map_metadata_is_an_error() {
        let proto = proto_with_label_map("not json");
        assert!(label_map_from_proto(&proto).is_err());
    }

    #[test]
    fn unknown_index_falls_back_to_unknown() {
        let labels = HashMap::from([(0, "hello".to_string())]);
        assert_eq!(label_for(&labels, 0), "hello");
        assert_eq!(label_for(&labels, 7), "unknown");
    }

    #[test]
    fn softmax_is_a_probability_distribution() {
        let probs = softmax(&[1.0, 2.0, 3.0, 4.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
        // monotone in the logits
        assert!(probs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn softmax_survives_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn argmax_picks_the_highest_probability() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn prediction_serializes_to_the_wire_shape() {
        let prediction = Prediction {
            label: "hello".to_string(),
            confidence: 0.5,
        };
        assert_eq!(
            serde_json::to_value(&prediction).unwrap(),
            serde_json::json!({"label": "hello", "confidence": 0.5})
        );
    }
}
