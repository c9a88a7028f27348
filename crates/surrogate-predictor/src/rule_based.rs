use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use replay_core::{
    Action, DecisionContext, DecisionPayload, ReplayError, ReplayResult, SurrogatePredictor,
};

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
const SCORE_THRESHOLD: f64 = 0.1;
const MODEL_VERSION: &str = "rules-v1";

/// Relative weight of each indicator vote. Normalized over the indicators
/// actually present in the context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleWeights {
    pub rsi: f64,
    pub ema: f64,
    pub macd: f64,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            rsi: 1.0,
            ema: 1.0,
            macd: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Vote {
    indicator: &'static str,
    action: Action,
    strength: f64,
    weight: f64,
    reason: String,
}

impl Vote {
    fn score(&self) -> f64 {
        match self.action {
            Action::Buy => 1.0,
            Action::Sell => -1.0,
            Action::Hold => 0.0,
        }
    }
}

/// Weighted vote over RSI extremes, EMA cross and MACD histogram sign.
///
/// Reads the features `rsi`, `ema_fast`/`ema_slow` and `macd_hist`; at least
/// one indicator must be present or the surrogate reports itself unavailable.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedSurrogate {
    weights: RuleWeights,
}

impl RuleBasedSurrogate {
    pub fn new(weights: RuleWeights) -> Self {
        Self { weights }
    }

    fn rsi_vote(&self, rsi: f64) -> Vote {
        let (action, strength, reason) = if rsi < RSI_OVERSOLD {
            (
                Action::Buy,
                ((RSI_OVERSOLD - rsi) / 10.0).min(1.0),
                format!("RSI oversold ({:.1})", rsi),
            )
        } else if rsi > RSI_OVERBOUGHT {
            (
                Action::Sell,
                ((rsi - RSI_OVERBOUGHT) / 10.0).min(1.0),
                format!("RSI overbought ({:.1})", rsi),
            )
        } else {
            (Action::Hold, 0.0, format!("RSI neutral ({:.1})", rsi))
        };
        Vote {
            indicator: "rsi",
            action,
            strength,
            weight: self.weights.rsi,
            reason,
        }
    }

    fn ema_vote(&self, fast: f64, slow: f64) -> Vote {
        let spread = if slow != 0.0 { (fast - slow) / slow.abs() } else { 0.0 };
        let strength = (spread.abs() * 50.0).min(1.0);
        let action = if spread > 0.0 {
            Action::Buy
        } else if spread < 0.0 {
            Action::Sell
        } else {
            Action::Hold
        };
        Vote {
            indicator: "ema",
            action,
            strength,
            weight: self.weights.ema,
            reason: format!("EMA spread {:+.2}%", spread * 100.0),
        }
    }

    fn macd_vote(&self, hist: f64) -> Vote {
        let action = if hist > 0.0 {
            Action::Buy
        } else if hist < 0.0 {
            Action::Sell
        } else {
            Action::Hold
        };
        Vote {
            indicator: "macd",
            action,
            strength: if hist == 0.0 { 0.0 } else { 0.5 },
            weight: self.weights.macd,
            reason: format!("MACD histogram {:+.4}", hist),
        }
    }

    fn votes(&self, context: &DecisionContext) -> Vec<Vote> {
        let mut votes = Vec::new();
        if let Some(rsi) = context.feature("rsi") {
            votes.push(self.rsi_vote(rsi));
        }
        if let (Some(fast), Some(slow)) = (context.feature("ema_fast"), context.feature("ema_slow"))
        {
            votes.push(self.ema_vote(fast, slow));
        }
        if let Some(hist) = context.feature("macd_hist") {
            votes.push(self.macd_vote(hist));
        }
        votes
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[async_trait]
impl SurrogatePredictor for RuleBasedSurrogate {
    async fn predict(&self, context: &DecisionContext) -> ReplayResult<DecisionPayload> {
        let votes = self.votes(context);
        let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
        if votes.is_empty() || total_weight <= 0.0 {
            return Err(ReplayError::SurrogateUnavailable(
                "no rsi/ema/macd features in context".to_string(),
            ));
        }

        let mut score = 0.0;
        let mut strength = 0.0;
        let mut reasons = Vec::new();
        for vote in &votes {
            let w = vote.weight / total_weight;
            score += vote.score() * vote.strength * w;
            strength += vote.strength * w;
            if vote.strength > 0.3 {
                reasons.push(format!("{}: {}", vote.indicator, vote.reason));
            }
        }

        let action = if score > SCORE_THRESHOLD {
            Action::Buy
        } else if score < -SCORE_THRESHOLD {
            Action::Sell
        } else {
            Action::Hold
        };
        let reasoning = if reasons.is_empty() {
            "No clear signals".to_string()
        } else {
            reasons.join(" | ")
        };

        Ok(DecisionPayload::new(
            action,
            round3(strength).clamp(0.0, 1.0),
            reasoning,
        ))
    }

    /// Non-default weights are encoded in the version.
    fn model_version(&self) -> String {
        if self.weights == RuleWeights::default() {
            return MODEL_VERSION.to_string();
        }
        format!(
            "{}[rsi={},ema={},macd={}]",
            MODEL_VERSION, self.weights.rsi, self.weights.ema, self.weights.macd
        )
    }
}
