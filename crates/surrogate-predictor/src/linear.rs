use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use replay_core::{
    Action, DecisionContext, DecisionPayload, ReplayError, ReplayResult, SurrogatePredictor,
};

/// Per-action coefficients, aligned with `LinearModelSnapshot::features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub action: Action,
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

/// Offline-trained multinomial logistic model, frozen as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModelSnapshot {
    pub version: String,
    pub features: Vec<String>,
    pub classes: Vec<ClassWeights>,
}

impl LinearModelSnapshot {
    pub fn validate(&self) -> ReplayResult<()> {
        if self.version.is_empty() {
            return Err(ReplayError::InvalidInput("model snapshot has no version".into()));
        }
        if self.classes.is_empty() {
            return Err(ReplayError::InvalidInput("model snapshot has no classes".into()));
        }
        for class in &self.classes {
            if class.weights.len() != self.features.len() {
                return Err(ReplayError::InvalidInput(format!(
                    "class {} has {} weights for {} features",
                    class.action,
                    class.weights.len(),
                    self.features.len()
                )));
            }
            if !class.bias.is_finite() || class.weights.iter().any(|w| !w.is_finite()) {
                return Err(ReplayError::InvalidInput(format!(
                    "class {} has non-finite coefficients",
                    class.action
                )));
            }
        }
        Ok(())
    }
}

/// Softmax-argmax over a `LinearModelSnapshot`. The winning class
/// probability becomes the decision's confidence; ties go to the class
/// listed first in the snapshot.
#[derive(Debug, Clone)]
pub struct LinearSurrogate {
    model: LinearModelSnapshot,
}

impl LinearSurrogate {
    pub fn new(model: LinearModelSnapshot) -> ReplayResult<Self> {
        model.validate()?;
        Ok(Self { model })
    }

    pub fn from_json(json: &str) -> ReplayResult<Self> {
        let model: LinearModelSnapshot = serde_json::from_str(json)?;
        Self::new(model)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ReplayResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let surrogate = Self::from_json(&json)?;
        tracing::info!(
            "Loaded linear surrogate {} ({} features) from {}",
            surrogate.model.version,
            surrogate.model.features.len(),
            path.as_ref().display()
        );
        Ok(surrogate)
    }

    fn inputs(&self, context: &DecisionContext) -> ReplayResult<Vec<f64>> {
        self.model
            .features
            .iter()
            .map(|name| {
                context.feature(name).ok_or_else(|| {
                    ReplayError::SurrogateUnavailable(format!(
                        "model {} needs feature '{}'",
                        self.model.version, name
                    ))
                })
            })
            .collect()
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

#[async_trait]
impl SurrogatePredictor for LinearSurrogate {
    async fn predict(&self, context: &DecisionContext) -> ReplayResult<DecisionPayload> {
        let x = self.inputs(context)?;

        let logits: Vec<f64> = self
            .model
            .classes
            .iter()
            .map(|c| c.bias + c.weights.iter().zip(&x).map(|(w, v)| w * v).sum::<f64>())
            .collect();
        let probs = softmax(&logits);

        let mut best = 0;
        for (i, p) in probs.iter().enumerate() {
            if *p > probs[best] {
                best = i;
            }
        }
        let confidence = probs[best];
        if !confidence.is_finite() {
            return Err(ReplayError::SurrogateUnavailable(format!(
                "model {} produced a non-finite probability",
                self.model.version
            )));
        }

        let action = self.model.classes[best].action;
        Ok(DecisionPayload::new(
            action,
            confidence.clamp(0.0, 1.0),
            format!("{} p={:.3}", self.model.version, confidence),
        ))
    }

    fn model_version(&self) -> String {
        self.model.version.clone()
    }
}
