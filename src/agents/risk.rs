// =============================================================================
// Risk Profile Agents — aggressive / conservative / neutral sizing
// =============================================================================
//
// Deterministic sizing from configured risk parameters:
//   risk_amount       = account_value * risk_pct
//   stop_per_unit     = price * stop_loss_pct
//   position_size     = risk_amount / stop_per_unit
// The three variants run as one parallel cohort and each writes only its own
// recommendation slot; the portfolio manager picks among them.
// =============================================================================

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agents::{Agent, AgentError};
use crate::config::RiskProfileParams;
use crate::state::{DecisionState, StateUpdate};

/// Which sizing profile an instance computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskProfile {
    Aggressive,
    Conservative,
    Neutral,
}

impl RiskProfile {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Conservative => "conservative",
            Self::Neutral => "neutral",
        }
    }
}

pub struct RiskAgent {
    profile: RiskProfile,
    params: RiskProfileParams,
    account_value: f64,
}

impl RiskAgent {
    pub fn new(profile: RiskProfile, params: RiskProfileParams, account_value: f64) -> Self {
        Self {
            profile,
            params,
            account_value,
        }
    }

    /// Units to hold so that a stop-out loses `risk_pct` of the account.
    fn position_size(&self, current_price: f64) -> f64 {
        let risk_amount = self.account_value * (self.params.risk_pct / 100.0);
        let stop_per_unit = current_price * (self.params.stop_loss_pct / 100.0);
        if stop_per_unit > 0.0 {
            (risk_amount / stop_per_unit).floor()
        } else {
            0.0
        }
    }

    fn build_output(&self, current_price: f64) -> Map<String, Value> {
        let mut out = Map::new();

        if current_price <= 0.0 {
            out.insert("position_size".to_string(), Value::from(0.0));
            out.insert("stop_loss_pct".to_string(), Value::from(0.0));
            out.insert("leverage".to_string(), Value::from(1.0));
            out.insert("risk_amount".to_string(), Value::from(0.0));
            return out;
        }

        let position_size = self.position_size(current_price);
        // Sizing is computed before the signal exists, so the stop price is
        // quoted for the long side; the portfolio manager mirrors it for
        // shorts.
        let stop_loss_price = current_price * (1.0 - self.params.stop_loss_pct / 100.0);

        out.insert("position_size".to_string(), Value::from(position_size));
        out.insert(
            "stop_loss_pct".to_string(),
            Value::from(self.params.stop_loss_pct),
        );
        out.insert("stop_loss_price".to_string(), Value::from(stop_loss_price));
        out.insert("leverage".to_string(), Value::from(self.params.leverage));
        out.insert(
            "risk_amount".to_string(),
            Value::from(self.account_value * (self.params.risk_pct / 100.0)),
        );
        out.insert("risk_pct".to_string(), Value::from(self.params.risk_pct));
        out
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn name(&self) -> &'static str {
        match self.profile {
            RiskProfile::Aggressive => "aggressive_risk",
            RiskProfile::Conservative => "conservative_risk",
            RiskProfile::Neutral => "neutral_risk",
        }
    }

    async fn process(
        &self,
        state: &DecisionState,
        _cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let output = self.build_output(state.current_price);

        let explanation = if state.current_price > 0.0 {
            format!(
                "{} risk: position_size={}, stop_loss={}%, leverage={}x",
                self.profile.as_str(),
                output
                    .get("position_size")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                self.params.stop_loss_pct,
                self.params.leverage,
            )
        } else {
            format!("{} risk: no price data", self.profile.as_str())
        };
        update.push_explanation(self.name(), explanation);

        match self.profile {
            RiskProfile::Aggressive => update.aggressive_risk = Some(output),
            RiskProfile::Conservative => update.conservative_risk = Some(output),
            RiskProfile::Neutral => update.neutral_risk = Some(output),
        }

        Ok(update)
    }
}
