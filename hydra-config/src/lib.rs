// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Configuration structs for the consensus engine and the tablet services.
//! Every field has a serde default so partial configs deserialize cleanly;
//! the defaults mirror what production deployments run with.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_commit_batch_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_max_commit_batch_record_count() -> usize {
    10_000
}

fn default_commit_flush_rpc_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_max_queue_mutation_count() -> usize {
    100_000
}

fn default_max_queue_mutation_data_size() -> usize {
    2 << 30
}

fn default_max_changelog_record_count() -> u32 {
    1_000_000
}

fn default_max_changelog_data_size() -> u64 {
    1 << 30
}

fn default_max_logged_mutations_per_request() -> usize {
    10_000
}

fn default_ping_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_close_changelogs() -> bool {
    true
}

fn default_max_kept_responses() -> usize {
    10_000
}

/// Tunables of the committers and the decorated automaton of one cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HydraConfig {
    /// Cadence of both the serialize and the flush periodic tasks.
    #[serde(default = "default_max_commit_batch_delay")]
    pub max_commit_batch_delay: Duration,
    /// Upper bound on drafts serialized, and records flushed to one
    /// follower, per iteration.
    #[serde(default = "default_max_commit_batch_record_count")]
    pub max_commit_batch_record_count: usize,
    #[serde(default = "default_commit_flush_rpc_timeout")]
    pub commit_flush_rpc_timeout: Duration,
    /// Count bound of the leader's in-memory mutation queue; shedding an
    /// uncommitted record past this bound fails the epoch.
    #[serde(default = "default_max_queue_mutation_count")]
    pub max_queue_mutation_count: usize,
    /// Byte bound of the same queue.
    #[serde(default = "default_max_queue_mutation_data_size")]
    pub max_queue_mutation_data_size: usize,
    /// Record-count threshold that triggers a checkpoint (rotation plus
    /// distributed snapshot).
    #[serde(default = "default_max_changelog_record_count")]
    pub max_changelog_record_count: u32,
    /// Byte threshold for the same.
    #[serde(default = "default_max_changelog_data_size")]
    pub max_changelog_data_size: u64,
    /// Upper bound on records a follower writes per logging task.
    #[serde(default = "default_max_logged_mutations_per_request")]
    pub max_logged_mutations_per_request: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Close rotated-out changelogs in the background.
    #[serde(default = "default_close_changelogs")]
    pub close_changelogs: bool,
    /// Capacity of the kept-response map serving mutation-id idempotency.
    #[serde(default = "default_max_kept_responses")]
    pub max_kept_responses: usize,
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            max_commit_batch_delay: default_max_commit_batch_delay(),
            max_commit_batch_record_count: default_max_commit_batch_record_count(),
            commit_flush_rpc_timeout: default_commit_flush_rpc_timeout(),
            max_queue_mutation_count: default_max_queue_mutation_count(),
            max_queue_mutation_data_size: default_max_queue_mutation_data_size(),
            max_changelog_record_count: default_max_changelog_record_count(),
            max_changelog_data_size: default_max_changelog_data_size(),
            max_logged_mutations_per_request: default_max_logged_mutations_per_request(),
            ping_interval: default_ping_interval(),
            close_changelogs: default_close_changelogs(),
            max_kept_responses: default_max_kept_responses(),
        }
    }
}

fn default_lookup_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_records_per_request() -> usize {
    64 * 1024
}

fn default_snapshot_block_size() -> usize {
    32 << 20
}

fn default_download_retries() -> usize {
    3
}

/// Tunables of recovery: snapshot and changelog download.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryConfig {
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout: Duration,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Changelog records fetched per `read_changelog` call.
    #[serde(default = "default_records_per_request")]
    pub records_per_request: usize,
    /// Snapshot bytes fetched per `read_snapshot` call.
    #[serde(default = "default_snapshot_block_size")]
    pub snapshot_block_size: usize,
    #[serde(default = "default_download_retries")]
    pub download_retries: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: default_lookup_timeout(),
            read_timeout: default_read_timeout(),
            records_per_request: default_records_per_request(),
            snapshot_block_size: default_snapshot_block_size(),
            download_retries: default_download_retries(),
        }
    }
}

fn default_balancer_period() -> Duration {
    Duration::from_secs(60)
}

fn default_min_balance_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_min_tablet_size() -> u64 {
    128 << 20
}

fn default_max_tablet_size() -> u64 {
    20 << 30
}

fn default_desired_tablet_size() -> u64 {
    10 << 30
}

fn default_action_expiration_time() -> Duration {
    Duration::from_secs(600)
}

/// Per-bundle balancing policy plus the balancer's own cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabletBalancerConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_balancer_period")]
    pub period: Duration,
    /// Two balance passes over one bundle are at least this far apart.
    #[serde(default = "default_min_balance_interval")]
    pub min_balance_interval: Duration,
    /// Tablets below this size are merge candidates.
    #[serde(default = "default_min_tablet_size")]
    pub min_tablet_size: u64,
    /// Tablets above this size are split candidates.
    #[serde(default = "default_max_tablet_size")]
    pub max_tablet_size: u64,
    /// Target size for tablets produced by a balancer reshard.
    #[serde(default = "default_desired_tablet_size")]
    pub desired_tablet_size: u64,
    /// Completed and failed actions older than this are swept.
    #[serde(default = "default_action_expiration_time")]
    pub action_expiration_time: Duration,
}

impl Default for TabletBalancerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            period: default_balancer_period(),
            min_balance_interval: default_min_balance_interval(),
            min_tablet_size: default_min_tablet_size(),
            max_tablet_size: default_max_tablet_size(),
            desired_tablet_size: default_desired_tablet_size(),
            action_expiration_time: default_action_expiration_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;

    #[test]
    fn empty_json_yields_defaults() {
        let config: HydraConfig = assert_ok!(serde_json::from_str("{}"));
        assert_eq!(config.max_commit_batch_record_count, 10_000);
        assert!(config.close_changelogs);

        let recovery: RecoveryConfig = assert_ok!(serde_json::from_str("{}"));
        assert_eq!(recovery.download_retries, 3);

        let balancer: TabletBalancerConfig = assert_ok!(serde_json::from_str("{}"));
        assert!(!balancer.enable);
        assert!(balancer.min_tablet_size < balancer.desired_tablet_size);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<HydraConfig>(r#"{"max_batch": 5}"#);
        claims::assert_err!(result);
    }
}
