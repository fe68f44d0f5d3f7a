//! Pluggable delay strategies shared by Retry and Circuit Breaker.

use crate::error::InvalidArgument;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Context passed to a [`DelayStrategy`] alongside the attempt number.
#[derive(Debug, Clone, Default)]
pub struct DelayContext {
    /// Human-readable description of the error that triggered this delay,
    /// if any (e.g. for logging or a custom provider's own decision-making).
    pub last_error: Option<String>,
}

impl DelayContext {
    /// Builds a context carrying the given error's `Display` output.
    pub fn with_error(error: &impl fmt::Display) -> Self {
        Self {
            last_error: Some(error.to_string()),
        }
    }
}

type CustomProvider = Arc<dyn Fn(u32, &DelayContext) -> Duration + Send + Sync>;

/// A pure function `(attempt, ctx) -> duration`. `attempt` starts at 1. A
/// return value of zero means "no delay" — skip the default sleeper
/// entirely (meaningful for [`DelayStrategy::Custom`], which may have
/// performed its own sleep already).
#[derive(Clone)]
pub enum DelayStrategy {
    /// Always zero delay.
    None,
    /// Fixed delay, optionally jittered by `± jitter * delay`.
    Constant { delay: Duration, jitter: f64 },
    /// `initial + initial * (attempt - 1) * multiplier`, clamped to `max`.
    Linear {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    },
    /// `initial * multiplier^(attempt - 1)`, clamped to `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    },
    /// Caller-supplied provider. May itself perform the sleep and return
    /// zero to bypass the default sleeper.
    Custom(CustomProvider),
}

impl fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "DelayStrategy::None"),
            Self::Constant { delay, jitter } => f
                .debug_struct("DelayStrategy::Constant")
                .field("delay", delay)
                .field("jitter", jitter)
                .finish(),
            Self::Linear {
                initial,
                multiplier,
                max,
                jitter,
            } => f
                .debug_struct("DelayStrategy::Linear")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => f
                .debug_struct("DelayStrategy::Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Self::Custom(_) => write!(f, "DelayStrategy::Custom(..)"),
        }
    }
}

fn validate_jitter(jitter: f64) -> Result<(), InvalidArgument> {
    if !(0.0..=1.0).contains(&jitter) {
        return Err(InvalidArgument::new(
            "randomization factor must be in [0, 1]",
        ));
    }
    Ok(())
}

fn apply_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter == 0.0 {
        return base;
    }
    let base_secs = base.as_secs_f64();
    let delta = base_secs * jitter;
    let offset = rand::thread_rng().gen_range(-delta..=delta);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

impl DelayStrategy {
    /// No delay between attempts.
    pub fn none() -> Self {
        Self::None
    }

    /// A fixed delay, jittered by up to `± jitter * delay`.
    ///
    /// Fails if `delay` is negative (impossible for `Duration`, kept for
    /// symmetry with the other constructors) or `jitter` is outside
    /// `[0, 1]`.
    pub fn constant(delay: Duration, jitter: f64) -> Result<Self, InvalidArgument> {
        validate_jitter(jitter)?;
        Ok(Self::Constant { delay, jitter })
    }

    /// Delay grows linearly with the attempt number.
    ///
    /// Fails if `initial` is zero, `max <= initial`, or `jitter` is outside
    /// `[0, 1]`.
    pub fn linear(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    ) -> Result<Self, InvalidArgument> {
        if initial.is_zero() {
            return Err(InvalidArgument::new("initial delay must be positive"));
        }
        if max <= initial {
            return Err(InvalidArgument::new("max delay must exceed initial delay"));
        }
        validate_jitter(jitter)?;
        Ok(Self::Linear {
            initial,
            multiplier,
            max,
            jitter,
        })
    }

    /// Delay grows exponentially with the attempt number.
    ///
    /// Fails if `initial` is zero, `multiplier <= 1.0`, `max <= initial`, or
    /// `jitter` is outside `[0, 1]`.
    pub fn exponential(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    ) -> Result<Self, InvalidArgument> {
        if initial.is_zero() {
            return Err(InvalidArgument::new("initial delay must be positive"));
        }
        if multiplier <= 1.0 {
            return Err(InvalidArgument::new(
                "exponential multiplier must be greater than 1.0",
            ));
        }
        if max <= initial {
            return Err(InvalidArgument::new("max delay must exceed initial delay"));
        }
        validate_jitter(jitter)?;
        Ok(Self::Exponential {
            initial,
            multiplier,
            max,
            jitter,
        })
    }

    /// Wraps a caller-supplied delay provider.
    pub fn custom(
        provider: impl Fn(u32, &DelayContext) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(provider))
    }

    /// Computes the delay before the given attempt (1-based).
    pub fn compute(&self, attempt: u32, ctx: &DelayContext) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::None => Duration::ZERO,
            Self::Constant { delay, jitter } => apply_jitter(*delay, *jitter),
            Self::Linear {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let steps = (attempt - 1) as f64;
                let base = initial.as_secs_f64() * (1.0 + steps * multiplier);
                let base = Duration::from_secs_f64(base.max(0.0).min(max.as_secs_f64()));
                apply_jitter(base, *jitter).clamp(Duration::ZERO, *max)
            }
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                let base = initial.as_secs_f64() * factor;
                let base = Duration::from_secs_f64(base.max(0.0).min(max.as_secs_f64()));
                apply_jitter(base, *jitter).clamp(Duration::ZERO, *max)
            }
            Self::Custom(provider) => provider(attempt, ctx),
        }
    }
}
