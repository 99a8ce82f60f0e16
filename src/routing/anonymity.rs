//! TTL and hop-count concealment.
//!
//! An observer comparing the ttl or hop count of messages it relays could
//! estimate how far away their origin is. With concealment active, hops skip
//! the ttl decrement at random, add a random increment, and the first hop
//! replaces the hop count with a sentinel.

use std::f64::consts::TAU;

use rand::Rng;

use crate::{
    config::AnonymityConfig,
    message::{HOP_COUNT_CONCEALED, Message},
};

/// Whether ttl concealment applies to `message`.
#[must_use]
pub fn conceals_ttl(config: &AnonymityConfig, message: &Message) -> bool {
    config.conceal_ttl || message.is_anonymous_route()
}

/// Whether hop-count concealment applies to `message`.
#[must_use]
pub fn conceals_hop_count(config: &AnonymityConfig, message: &Message) -> bool {
    config.conceal_hop_count || message.is_anonymous_route()
}

/// Count one more hop unless the hop count is already concealed.
pub fn increment_hop_count(message: &mut Message) {
    if !message.is_hop_count_concealed() {
        message.hop_count = message.hop_count.saturating_add(1).min(HOP_COUNT_CONCEALED - 1);
    }
}

/// Apply this hop's ttl update.
///
/// The caller has already rejected messages arriving with a ttl of zero.
pub fn update_ttl(config: &AnonymityConfig, message: &mut Message, rng: &mut impl Rng) {
    let conceal = conceals_ttl(config, message);
    let decrement = !conceal || rng.gen_bool(config.decrease_ttl_probability.clamp(0.0, 1.0));
    if decrement {
        message.ttl = message.ttl.saturating_sub(1);
    }
    if conceal && config.increase_ttl_by_random_num {
        message.ttl = message.ttl.saturating_add(random_increment(config, rng));
    }
}

/// Draw a non-negative ttl increment from the configured normal distribution.
///
/// Negative draws are folded to their absolute value or clamped at zero; the
/// result is then optionally reduced modulo the configured value.
pub fn random_increment(config: &AnonymityConfig, rng: &mut impl Rng) -> u16 {
    let draw = standard_normal(rng)
        .mul_add(config.increase_ttl_stddev, config.increase_ttl_mean)
        .round();
    let draw = if config.increase_ttl_absolute {
        draw.abs()
    } else {
        draw.max(0.0)
    };
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "draw is non-negative and clamped to the u16 range"
    )]
    let increment = draw.min(f64::from(u16::MAX)) as u16;
    match config.increase_ttl_modulo {
        0 => increment,
        modulo => increment % modulo,
    }
}

/// Box–Muller transform over two uniform samples.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1 = 1.0 - rng.r#gen::<f64>();
    let u2 = rng.r#gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}
