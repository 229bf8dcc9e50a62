use serde::{Deserialize, Serialize};

/// Per-agent usage counters, aggregated up to the session on read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_cents: f64,
}

impl AgentMetrics {
    pub fn accumulate(&mut self, other: &AgentMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_cents += other.cost_cents;
    }
}

impl std::ops::AddAssign for AgentMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.accumulate(&rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_fields() {
        let mut total = AgentMetrics::default();
        total += AgentMetrics {
            input_tokens: 1000,
            output_tokens: 400,
            cost_cents: 0.8,
        };
        total += AgentMetrics {
            input_tokens: 250,
            output_tokens: 100,
            cost_cents: 0.2,
        };
        assert_eq!(total.input_tokens, 1250);
        assert_eq!(total.output_tokens, 500);
        assert!((total.cost_cents - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_roundtrip() {
        let m = AgentMetrics {
            input_tokens: 7,
            output_tokens: 3,
            cost_cents: 0.01,
        };
        let json = serde_json::to_string(&m).unwrap();
        let parsed: AgentMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, m);
    }
}
