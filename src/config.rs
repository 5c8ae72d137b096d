//! Engine configuration structs.
//!
//! Each subsystem takes one config value at construction. Defaults carry
//! the engine's standard constants; `with_*` builders cover the knobs that
//! vary per deployment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Queue-level settings shared by producers and consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// TTL of the `idempotence:{key}` dedup side-channel, in seconds.
    pub idempotence_ttl_seconds: u64,
    /// Blocking-read timeout for the consume loop, in milliseconds.
    pub block_time_ms: u64,
    /// Max messages fetched per blocking read.
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idempotence_ttl_seconds: 86_400,
            block_time_ms: 5_000,
            batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn with_idempotence_ttl(mut self, seconds: u64) -> Self {
        self.idempotence_ttl_seconds = seconds;
        self
    }

    pub fn with_block_time_ms(mut self, ms: u64) -> Self {
        self.block_time_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers to start with.
    pub concurrency: usize,
    /// Stream topic the pool consumes.
    pub topic: String,
    /// Consumer group name.
    pub consumer_group: String,
    /// Whether the queue-depth autoscaler runs.
    pub auto_scale: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Autoscaler tick interval.
    pub scale_interval: Duration,
    /// How long `stop` waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// PEL scavenger tick interval.
    pub claim_interval: Duration,
    /// Idle age before a pending entry is claimed from a dead consumer.
    pub claim_min_idle_ms: u64,
    pub queue: QueueConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            concurrency: cpus.min(4),
            topic: "tasks".to_string(),
            consumer_group: "phase-workers".to_string(),
            auto_scale: false,
            min_workers: 1,
            max_workers: 8,
            scale_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(2),
            claim_interval: Duration::from_secs(30),
            claim_min_idle_ms: 120_000,
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_auto_scale(mut self, min: usize, max: usize) -> Self {
        self.auto_scale = true;
        self.min_workers = min;
        self.max_workers = max;
        self
    }
}

/// Heartbeat cadence: one repository stamp plus one KV write per interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// TTL of the `heartbeat:{task_id}` KV key.
pub const HEARTBEAT_KV_TTL_SECONDS: u64 = 300;

/// Flat a-priori cost estimate: USD per 1000 tokens.
pub const COST_PER_1K_TOKENS_USD: f64 = 0.01;

/// Per-resource preemption thresholds, as utilization percentages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Utilization at which P3 tasks become preemption candidates.
    pub preempt_p3: f64,
    /// Utilization at which P2 tasks join them.
    pub preempt_p2: f64,
}

/// Preemption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionConfig {
    pub enable_preemption: bool,
    pub cpu: ResourceThresholds,
    pub memory: ResourceThresholds,
    pub gpu: ResourceThresholds,
    pub budget: ResourceThresholds,
    /// Time a preempted executor gets to reach a checkpoint.
    pub grace_period: Duration,
    /// Delay before a preempted task is retried.
    pub retry_delay: Duration,
    /// Preemption count after which the task is failed instead.
    pub max_preemptions: u32,
    /// `start_monitoring` tick interval.
    pub monitor_interval: Duration,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            enable_preemption: true,
            cpu: ResourceThresholds { preempt_p3: 80.0, preempt_p2: 90.0 },
            memory: ResourceThresholds { preempt_p3: 85.0, preempt_p2: 95.0 },
            gpu: ResourceThresholds { preempt_p3: 80.0, preempt_p2: 90.0 },
            budget: ResourceThresholds { preempt_p3: 90.0, preempt_p2: 98.0 },
            grace_period: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            max_preemptions: 3,
            monitor_interval: Duration::from_secs(30),
        }
    }
}

impl PreemptionConfig {
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_preemptions(mut self, max: u32) -> Self {
        self.max_preemptions = max;
        self
    }

    pub fn disabled() -> Self {
        Self { enable_preemption: false, ..Self::default() }
    }
}

/// Memory vault settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Token budget for a context pack.
    pub pack_token_budget: u64,
    /// Candidate retrieval cap is `candidate_multiplier * limit`.
    pub candidate_multiplier: usize,
    /// Grounding guard acceptance threshold.
    pub grounding_threshold: f64,
    /// Max claims per citation before grounding fails outright.
    pub max_claims_per_citation: f64,
    /// Default TTLs per scope, in milliseconds.
    pub ttl_ephemeral_ms: u64,
    pub ttl_run_ms: u64,
    pub ttl_tenant_ms: u64,
    pub ttl_global_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            pack_token_budget: 4_000,
            candidate_multiplier: 3,
            grounding_threshold: 0.7,
            max_claims_per_citation: 5.0,
            ttl_ephemeral_ms: 60 * 60 * 1_000,
            ttl_run_ms: 7 * 24 * 60 * 60 * 1_000,
            ttl_tenant_ms: 30 * 24 * 60 * 60 * 1_000,
            ttl_global_ms: 90 * 24 * 60 * 60 * 1_000,
        }
    }
}

impl VaultConfig {
    pub fn with_pack_budget(mut self, tokens: u64) -> Self {
        self.pack_token_budget = tokens;
        self
    }
}

/// Checkpoint storage settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Size cap on the opaque checkpoint blob, in bytes.
    pub max_bytes: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { max_bytes: 1024 * 1024 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults_match_contract() {
        let config = WorkerPoolConfig::default();
        assert!(config.concurrency >= 1 && config.concurrency <= 4);
        assert_eq!(config.topic, "tasks");
        assert_eq!(config.consumer_group, "phase-workers");
        assert_eq!(config.queue.idempotence_ttl_seconds, 86_400);
        assert_eq!(config.queue.block_time_ms, 5_000);
        assert_eq!(config.queue.batch_size, 10);
    }

    #[test]
    fn test_preemption_defaults() {
        let config = PreemptionConfig::default();
        assert!(config.enable_preemption);
        assert_eq!(config.max_preemptions, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(60));
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.monitor_interval, Duration::from_secs(30));
        assert!(!PreemptionConfig::disabled().enable_preemption);
    }

    #[test]
    fn test_vault_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.pack_token_budget, 4_000);
        assert_eq!(config.grounding_threshold, 0.7);
    }
}
