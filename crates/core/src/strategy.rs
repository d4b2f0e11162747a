use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Resource-selection policy of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    Fifo,
    Priority,
    Weighted,
    RoundRobin,
    LeastLoaded,
    Custom,
}

impl SchedulingStrategy {
    pub const ALL: [SchedulingStrategy; 6] = [
        SchedulingStrategy::Fifo,
        SchedulingStrategy::Priority,
        SchedulingStrategy::Weighted,
        SchedulingStrategy::RoundRobin,
        SchedulingStrategy::LeastLoaded,
        SchedulingStrategy::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "fifo",
            SchedulingStrategy::Priority => "priority",
            SchedulingStrategy::Weighted => "weighted",
            SchedulingStrategy::RoundRobin => "round_robin",
            SchedulingStrategy::LeastLoaded => "least_loaded",
            SchedulingStrategy::Custom => "custom",
        }
    }
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Fifo
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingStrategy {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "fifo" => Ok(SchedulingStrategy::Fifo),
            "priority" => Ok(SchedulingStrategy::Priority),
            "weighted" => Ok(SchedulingStrategy::Weighted),
            "round_robin" => Ok(SchedulingStrategy::RoundRobin),
            "least_loaded" => Ok(SchedulingStrategy::LeastLoaded),
            "custom" => Ok(SchedulingStrategy::Custom),
            _ => Err(KilnError::Config(format!("unknown scheduling strategy: {}", s))),
        }
    }
}

/// How the multiplexer places a submission on one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
}

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::LeastLoaded => "least_loaded",
        }
    }
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::RoundRobin
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "least_loaded" => Ok(RoutingStrategy::LeastLoaded),
            _ => Err(KilnError::Config(format!("unknown routing strategy: {}", s))),
        }
    }
}

/// Accept `ROUND_ROBIN`, `round-robin`, `RoundRobin` and friends.
fn normalize(s: &str) -> String {
    let trimmed = s.trim();
    let mut out = String::with_capacity(trimmed.len() + 4);
    let mut prev_lower = false;
    for c in trimmed.chars() {
        if c == '-' || c == ' ' {
            out.push('_');
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev_lower = c.is_ascii_lowercase();
    }
    out
}
