//! Node configuration.
//!
//! Every option is named as hosts spell it in their property sources
//! (`AckTimeout`, `ConcealTTL`, ...) so a configuration can be deserialised
//! from any serde format. Durations are given in milliseconds. Values that
//! would make the node misbehave are rejected up front by
//! [`OverlayConfig::validate`]; a node never starts on an invalid
//! configuration.

use std::{collections::HashMap, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    byte_order::ByteOrder,
    codec::{EXTENSION_ENTRY_OVERHEAD, FIXED_HEADER_LEN},
    fragment::FRAGMENT_EXTENSION_LEN,
    message::MessageType,
    pipeline::ProcessorKind,
    transport::MAX_OUTBOUND_RATE,
};

/// Errors raised while validating a configuration.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// An option that must be positive was zero.
    #[error("{option} must be greater than zero")]
    Zero { option: &'static str },
    /// A probability or fraction was outside `[0, 1]`.
    #[error("{option} must lie within [0, 1], got {value}")]
    OutOfUnitRange { option: &'static str, value: f64 },
    /// A value that must not be negative was negative.
    #[error("{option} must not be negative, got {value}")]
    Negative { option: &'static str, value: f64 },
    /// The fragment length cannot hold even an empty fragment header.
    #[error("FragmentLength {length} is smaller than the minimum header of {minimum} bytes")]
    FragmentLengthTooSmall { length: usize, minimum: usize },
    /// The outbound pacing rate is zero or above the supported maximum.
    #[error("OutboundRate {rate} must lie within [1, {max}]", max = MAX_OUTBOUND_RATE)]
    OutboundRate { rate: usize },
    /// A pipeline referenced a processor that does not exist.
    #[error("unknown processor {0:?}")]
    UnknownProcessor(String),
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete configuration of one overlay node.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct OverlayConfig {
    /// Period of the background maintenance sweep.
    #[serde(with = "millis")]
    pub schedule_interval: Duration,
    pub byte_order: ByteOrder,
    pub acks: AckConfig,
    pub routing: RoutingConfig,
    pub anonymity: AnonymityConfig,
    pub fragments: FragmentConfig,
    pub duplicates: DedupConfig,
    pub rate_limit: RateLimitConfig,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_millis(500),
            byte_order: ByteOrder::Big,
            acks: AckConfig::default(),
            routing: RoutingConfig::default(),
            anonymity: AnonymityConfig::default(),
            fragments: FragmentConfig::default(),
            duplicates: DedupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pipeline: PipelineConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl OverlayConfig {
    /// Check every option for values the node cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_duration("ScheduleInterval", self.schedule_interval)?;
        non_zero_duration("AckTimeout", self.acks.ack_timeout)?;
        non_zero_duration(
            "RegisteredRoutesRetentionTime",
            self.routing.registered_routes_retention_time,
        )?;
        non_zero_duration(
            "FragmentsRetentionPeriod",
            self.fragments.fragments_retention_period,
        )?;
        non_zero_duration("RetentionPeriod", self.duplicates.retention_period)?;
        non_zero_duration("RateLimitWindow", self.rate_limit.rate_limit_window)?;

        unit_range(
            "DecreaseTTLProbability",
            self.anonymity.decrease_ttl_probability,
        )?;
        unit_range(
            "SteinhausPointAnonymityDistanceFactor",
            self.anonymity.steinhaus_point_anonymity_distance_factor,
        )?;
        if self.anonymity.increase_ttl_stddev < 0.0 {
            return Err(ConfigError::Negative {
                option: "IncreaseTTLByRandomNumStddev",
                value: self.anonymity.increase_ttl_stddev,
            });
        }

        let minimum = FIXED_HEADER_LEN + EXTENSION_ENTRY_OVERHEAD + FRAGMENT_EXTENSION_LEN + 1;
        if self.fragments.fragment_length < minimum {
            return Err(ConfigError::FragmentLengthTooSmall {
                length: self.fragments.fragment_length,
                minimum,
            });
        }
        if self.duplicates.cache_max_size == Some(0) {
            return Err(ConfigError::Zero {
                option: "CacheMaxSize",
            });
        }
        if self.transport.inbound_capacity == 0 {
            return Err(ConfigError::Zero {
                option: "InboundCapacity",
            });
        }
        if self.transport.outbound_capacity == 0 {
            return Err(ConfigError::Zero {
                option: "OutboundCapacity",
            });
        }

        if let Some(rate) = self.transport.outbound_rate
            && (rate == 0 || rate > MAX_OUTBOUND_RATE)
        {
            return Err(ConfigError::OutboundRate { rate });
        }

        self.pipeline.send_kinds()?;
        self.pipeline.receive_kinds()?;
        Ok(())
    }
}

fn non_zero_duration(option: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Zero { option });
    }
    Ok(())
}

fn unit_range(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { option, value })
    }
}

/// Acknowledgment and retry settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AckConfig {
    /// Track DATA messages and expect a DATA_ACK for each.
    pub enabled: bool,
    /// Delay before an unacknowledged message is resent.
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    /// Resends attempted before the message is reported undelivered.
    pub send_attempts: u32,
    /// Force secure routing once this many resends have happened.
    pub apply_secure_routing_after_not_delivered_count: Option<u32>,
    /// Force next-hop skipping once this many resends have happened.
    pub apply_skipping_next_hops_after_not_delivered_count: Option<u32>,
    /// Require the acknowledgment to come from the original recipient.
    pub validate_ack_sender: bool,
    /// Return acknowledgments along the registered route instead of
    /// directly to the advertised sender address.
    pub acknowledge_along_registered_route: bool,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ack_timeout: Duration::from_secs(3),
            send_attempts: 3,
            apply_secure_routing_after_not_delivered_count: Some(1),
            apply_skipping_next_hops_after_not_delivered_count: Some(2),
            validate_ack_sender: false,
            acknowledge_along_registered_route: true,
        }
    }
}

/// Route registration policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RoutingConfig {
    pub allow_registered_routes: bool,
    pub allow_anonymous_routes: bool,
    /// Age after which a registered route is forgotten.
    #[serde(with = "millis")]
    pub registered_routes_retention_time: Duration,
    /// Seed for the routing random source; entropy is used when absent.
    pub rng_seed: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            allow_registered_routes: true,
            allow_anonymous_routes: true,
            registered_routes_retention_time: Duration::from_secs(600),
            rng_seed: None,
        }
    }
}

/// Traffic-analysis resistance settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AnonymityConfig {
    /// Apply secure routing to every message from its first hop.
    pub secure_routing: bool,
    /// Skip random next hops for every message from its first hop.
    pub skip_random_next_hops: bool,
    /// Apply the prefix-mismatch heuristic for every message from its first hop.
    pub prefix_mismatch_heuristic: bool,
    /// Treat every message as requiring anonymity.
    pub anonymity_required: bool,
    #[serde(rename = "ConcealTTL")]
    pub conceal_ttl: bool,
    /// Probability that a hop decrements the TTL while concealment is active.
    #[serde(rename = "DecreaseTTLProbability")]
    pub decrease_ttl_probability: f64,
    #[serde(rename = "IncreaseTTLByRandomNum")]
    pub increase_ttl_by_random_num: bool,
    #[serde(rename = "IncreaseTTLByRandomNumMean")]
    pub increase_ttl_mean: f64,
    #[serde(rename = "IncreaseTTLByRandomNumStddev")]
    pub increase_ttl_stddev: f64,
    /// Fold negative draws to their absolute value instead of clamping at zero.
    #[serde(rename = "IncreaseTTLByRandomNumAbsolute")]
    pub increase_ttl_absolute: bool,
    /// Reduce draws modulo this value; zero disables the reduction.
    #[serde(rename = "IncreaseTTLByRandomNumModulo")]
    pub increase_ttl_modulo: u16,
    pub conceal_hop_count: bool,
    pub ensure_steinhaus_point_anonymity: bool,
    pub steinhaus_point_anonymity_distance_factor: f64,
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            secure_routing: false,
            skip_random_next_hops: false,
            prefix_mismatch_heuristic: false,
            anonymity_required: false,
            conceal_ttl: false,
            decrease_ttl_probability: 1.0,
            increase_ttl_by_random_num: false,
            increase_ttl_mean: 0.0,
            increase_ttl_stddev: 1.0,
            increase_ttl_absolute: true,
            increase_ttl_modulo: 0,
            conceal_hop_count: false,
            ensure_steinhaus_point_anonymity: false,
            steinhaus_point_anonymity_distance_factor: 0.5,
        }
    }
}

/// Fragmentation and reassembly limits.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FragmentConfig {
    /// Largest encoded frame handed to the transport.
    pub fragment_length: usize,
    /// Age after which incomplete assemblies are purged.
    #[serde(with = "millis")]
    pub fragments_retention_period: Duration,
    /// Drop refilled fragment slots instead of overwriting them.
    pub prevent_fragment_duplicates: bool,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            fragment_length: 1400,
            fragments_retention_period: Duration::from_secs(30),
            prevent_fragment_duplicates: true,
        }
    }
}

/// Duplicate suppression at the final recipient.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DedupConfig {
    pub prevent_duplicates: bool,
    /// Include the payload checksum in the duplicate key.
    #[serde(rename = "IncludeCRC")]
    pub include_crc: bool,
    #[serde(with = "millis")]
    pub retention_period: Duration,
    /// Upper bound on remembered keys; the oldest are evicted first.
    pub cache_max_size: Option<usize>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            prevent_duplicates: true,
            include_crc: false,
            retention_period: Duration::from_secs(60),
            cache_max_size: Some(10_000),
        }
    }
}

/// Sliding-window rate limits on processed messages.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateLimitConfig {
    /// Maximum messages of any type per window; unlimited when absent.
    pub limit_max_processed_messages_rate: Option<usize>,
    /// Per-type maxima; a listed type is counted in its own window instead
    /// of the global one.
    pub per_type_limits: HashMap<MessageType, usize>,
    #[serde(with = "millis")]
    pub rate_limit_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit_max_processed_messages_rate: None,
            per_type_limits: HashMap::new(),
            rate_limit_window: Duration::from_secs(1),
        }
    }
}

/// Ordered processor chains per direction.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PipelineConfig {
    pub send_processors: Vec<String>,
    pub receive_processors: Vec<String>,
    /// Let nodes relaying a route-back message run it through their type
    /// processors before passing it on.
    pub process_route_back_messages_by_nodes_on_route: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_processors: ["RateLimit", "AckTracking"]
                .map(String::from)
                .to_vec(),
            receive_processors: ["RouteBack", "Dedup", "RateLimit", "Data", "DataAck", "Forward"]
                .map(String::from)
                .to_vec(),
            process_route_back_messages_by_nodes_on_route: false,
        }
    }
}

impl PipelineConfig {
    /// Resolve the send chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProcessor`] for an unrecognised name.
    pub fn send_kinds(&self) -> Result<Vec<ProcessorKind>, ConfigError> {
        resolve(&self.send_processors)
    }

    /// Resolve the receive chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProcessor`] for an unrecognised name.
    pub fn receive_kinds(&self) -> Result<Vec<ProcessorKind>, ConfigError> {
        resolve(&self.receive_processors)
    }
}

fn resolve(names: &[String]) -> Result<Vec<ProcessorKind>, ConfigError> {
    names
        .iter()
        .map(|name| {
            ProcessorKind::from_str(name).map_err(|_| ConfigError::UnknownProcessor(name.clone()))
        })
        .collect()
}

/// Queue sizing between the node and its transport.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransportConfig {
    /// Frames waiting per inbound worker category.
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    /// Frames per second handed to the transport; unpaced when absent.
    pub outbound_rate: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
            outbound_capacity: 1024,
            outbound_rate: None,
        }
    }
}
