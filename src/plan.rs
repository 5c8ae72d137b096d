//! Phase plan: the declarative description of one pipeline stage.
//!
//! A plan names the phase, the agents to fan out, the token and tool
//! budgets to split across them, the rubrics the gate will score against,
//! and a wall-clock timebox expressed as an ISO-8601 duration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of pipeline stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseName {
    Intake,
    Ideation,
    Prd,
    Qa,
    Deploy,
}

impl PhaseName {
    /// The canonical uppercase name, used as the idempotence key prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "INTAKE",
            Self::Ideation => "IDEATION",
            Self::Prd => "PRD",
            Self::Qa => "QA",
            Self::Deploy => "DEPLOY",
        }
    }

    /// Parse a canonical phase name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INTAKE" => Ok(Self::Intake),
            "IDEATION" => Ok(Self::Ideation),
            "PRD" => Ok(Self::Prd),
            "QA" => Ok(Self::Qa),
            "DEPLOY" => Ok(Self::Deploy),
            other => bail!("Unknown phase name: {other}"),
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the coordinator runs a plan's agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// Agents run one at a time, in plan order.
    Sequential,
    /// Agents run concurrently, bounded by the phase concurrency cap.
    #[default]
    Parallel,
}

/// Budgets a plan splits across its agent tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBudgets {
    /// Total token budget for the phase.
    pub tokens: u64,
    /// Total tool wall-clock budget, in minutes.
    pub tools_minutes: u64,
}

/// Declarative description of one phase's work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasePlan {
    pub phase: PhaseName,
    #[serde(default)]
    pub parallelism: Parallelism,
    /// Executor targets, one task per agent.
    pub agents: Vec<String>,
    pub budgets: PlanBudgets,
    /// Rubrics the quality gate scores against. Opaque to the engine.
    #[serde(default)]
    pub rubrics: Value,
    /// ISO-8601 duration, e.g. "PT30M".
    pub timebox: String,
    /// Plan version; part of the idempotence key.
    pub version: String,
}

impl PhasePlan {
    /// The timebox in milliseconds.
    pub fn timebox_ms(&self) -> Result<u64> {
        parse_iso8601_duration_ms(&self.timebox)
            .with_context(|| format!("Invalid timebox '{}'", self.timebox))
    }
}

/// Parse an ISO-8601 duration (`PnDTnHnMnS` subset, no years/months) into
/// milliseconds. Fractional seconds are supported.
pub fn parse_iso8601_duration_ms(s: &str) -> Result<u64> {
    let rest = s.strip_prefix('P').context("duration must start with 'P'")?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut total_ms: f64 = 0.0;
    let mut parse_fields = |part: &str, in_time: bool| -> Result<()> {
        let mut num = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                num.push(c);
                continue;
            }
            let value: f64 = num
                .parse()
                .with_context(|| format!("bad number in duration '{s}'"))?;
            num.clear();
            let ms = match (c, in_time) {
                ('D', false) => value * 86_400_000.0,
                ('H', true) => value * 3_600_000.0,
                ('M', true) => value * 60_000.0,
                ('S', true) => value * 1_000.0,
                _ => bail!("unsupported duration designator '{c}' in '{s}'"),
            };
            total_ms += ms;
        }
        if !num.is_empty() {
            bail!("trailing number without designator in '{s}'");
        }
        Ok(())
    };

    parse_fields(date_part, false)?;
    if let Some(t) = time_part {
        parse_fields(t, true)?;
    }
    Ok(total_ms as u64)
}
