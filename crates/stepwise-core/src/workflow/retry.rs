//! Retry policy resolution and backoff computation.
//!
//! Named profiles supply a baseline [`RetryPolicy`]; definition defaults and
//! node-level overrides are merged on top field by field. Delays grow
//! exponentially from `backoff_ms`, are capped at `max_backoff_ms`, and are
//! perturbed by a symmetric jitter band. With `jitter_ratio == 0` the delay is
//! a pure function of the policy and attempt number.

use std::fmt;
use std::str::FromStr;

use stepwise_types::workflow::{RetryOverride, RetryPolicy, WorkflowDefaults, WorkflowNode};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while resolving a retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("unknown retry profile '{0}' (expected fast_safe, balanced or strict_enterprise)")]
    UnknownProfile(String),

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Named baseline retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryProfile {
    FastSafe,
    Balanced,
    StrictEnterprise,
}

impl RetryProfile {
    pub const ALL: [RetryProfile; 3] = [
        RetryProfile::FastSafe,
        RetryProfile::Balanced,
        RetryProfile::StrictEnterprise,
    ];

    /// The fixed baseline policy for this profile.
    pub fn policy(&self) -> RetryPolicy {
        match self {
            RetryProfile::FastSafe => RetryPolicy {
                max_attempts: 2,
                backoff_ms: 300,
                max_backoff_ms: 2_000,
                jitter_ratio: 0.05,
            },
            RetryProfile::Balanced => RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1_000,
                max_backoff_ms: 10_000,
                jitter_ratio: 0.1,
            },
            RetryProfile::StrictEnterprise => RetryPolicy {
                max_attempts: 5,
                backoff_ms: 2_000,
                max_backoff_ms: 60_000,
                jitter_ratio: 0.2,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryProfile::FastSafe => "fast_safe",
            RetryProfile::Balanced => "balanced",
            RetryProfile::StrictEnterprise => "strict_enterprise",
        }
    }
}

impl fmt::Display for RetryProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryProfile {
    type Err = RetryPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fast_safe" => Ok(RetryProfile::FastSafe),
            "balanced" => Ok(RetryProfile::Balanced),
            "strict_enterprise" => Ok(RetryProfile::StrictEnterprise),
            other => Err(RetryPolicyError::UnknownProfile(other.to_string())),
        }
    }
}

/// Return the baseline policy for a named profile.
pub fn get_profile(name: &str) -> Result<RetryPolicy, RetryPolicyError> {
    Ok(name.parse::<RetryProfile>()?.policy())
}

/// Resolve a profile merged field by field with explicit overrides (overrides win).
///
/// The `profile` field of `overrides` is ignored here; callers pick the
/// profile name.
pub fn resolve_policy(
    profile_name: &str,
    overrides: Option<&RetryOverride>,
) -> Result<RetryPolicy, RetryPolicyError> {
    let base = get_profile(profile_name)?;
    let policy = match overrides {
        Some(o) => apply_overrides(base, o),
        None => base,
    };
    validate_policy(&policy)?;
    Ok(policy)
}

fn apply_overrides(base: RetryPolicy, o: &RetryOverride) -> RetryPolicy {
    RetryPolicy {
        max_attempts: o.max_attempts.unwrap_or(base.max_attempts),
        backoff_ms: o.backoff_ms.unwrap_or(base.backoff_ms),
        max_backoff_ms: o.max_backoff_ms.unwrap_or(base.max_backoff_ms),
        jitter_ratio: o.jitter_ratio.unwrap_or(base.jitter_ratio),
    }
}

/// Check the structural invariants of a policy.
pub fn validate_policy(policy: &RetryPolicy) -> Result<(), RetryPolicyError> {
    if policy.max_attempts < 1 {
        return Err(RetryPolicyError::InvalidPolicy(
            "max_attempts must be >= 1".to_string(),
        ));
    }
    if policy.max_backoff_ms < policy.backoff_ms {
        return Err(RetryPolicyError::InvalidPolicy(format!(
            "max_backoff_ms ({}) must be >= backoff_ms ({})",
            policy.max_backoff_ms, policy.backoff_ms
        )));
    }
    if !(0.0..=1.0).contains(&policy.jitter_ratio) {
        return Err(RetryPolicyError::InvalidPolicy(format!(
            "jitter_ratio ({}) must be within [0, 1]",
            policy.jitter_ratio
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Delay computation
// ---------------------------------------------------------------------------

/// Delay in milliseconds before retrying after failed attempt `attempt` (1-based).
///
/// Uses the thread-local RNG for jitter.
pub fn compute_retry_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    compute_retry_delay_with(policy, attempt, rand::random::<f64>)
}

/// Same as [`compute_retry_delay`] with an explicit random source in `[0, 1)`.
///
/// The random value is mapped linearly onto `[-1, +1]` and scales a jitter
/// band of `delay * jitter_ratio`. The result is clamped to `>= 0` and rounded
/// to the nearest millisecond.
pub fn compute_retry_delay_with<F>(policy: &RetryPolicy, attempt: u32, mut random: F) -> u64
where
    F: FnMut() -> f64,
{
    let base = base_delay(policy, attempt);
    if policy.jitter_ratio <= 0.0 {
        return base;
    }

    let r = random().clamp(0.0, 1.0);
    let spread = r * 2.0 - 1.0;
    let delay = base as f64;
    let jittered = delay + delay * policy.jitter_ratio * spread;
    jittered.max(0.0).round() as u64
}

/// `min(backoff_ms * 2^(attempt-1), max_backoff_ms)` without overflow.
fn base_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    let exponent = attempt.max(1) - 1;
    let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
    policy
        .backoff_ms
        .saturating_mul(factor)
        .min(policy.max_backoff_ms)
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decisions for workflow node failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Effective policy for a node.
    ///
    /// A node that names its own profile starts from that profile and applies
    /// only its own overrides. Otherwise the definition default (profile plus
    /// overrides, or `fallback_profile`) is the baseline and node overrides
    /// are applied on top.
    pub fn policy_for_node(
        defaults: &WorkflowDefaults,
        node: &WorkflowNode,
        fallback_profile: &str,
    ) -> Result<RetryPolicy, RetryPolicyError> {
        if let Some(node_retry) = &node.retry {
            if let Some(profile) = &node_retry.profile {
                return resolve_policy(profile, Some(node_retry));
            }
        }

        let default_profile = defaults
            .retry
            .as_ref()
            .and_then(|r| r.profile.as_deref())
            .unwrap_or(fallback_profile);
        let base = resolve_policy(default_profile, defaults.retry.as_ref())?;

        match &node.retry {
            Some(node_retry) => {
                let policy = apply_overrides(base, node_retry);
                validate_policy(&policy)?;
                Ok(policy)
            }
            None => Ok(base),
        }
    }

    /// Prompt used when a compensation block has no template of its own.
    pub fn default_compensation_prompt() -> &'static str {
        "## Workflow Compensation\n\
         \n\
         Workflow node '{{ compensation.node_id }}' failed on attempt \
         {{ compensation.attempt }} and will be retried.\n\
         \n\
         **Error:**\n\
         ```\n\
         {{ compensation.error }}\n\
         ```\n\
         \n\
         Undo or account for any partial side effects of the failed attempt so \
         the retry starts from a clean state. Reply with a short summary of \
         what you changed."
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::workflow::NodeType;

    fn policy(backoff_ms: u64, max_backoff_ms: u64, jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            backoff_ms,
            max_backoff_ms,
            jitter_ratio,
        }
    }

    fn node_with_retry(retry: Option<RetryOverride>) -> WorkflowNode {
        WorkflowNode {
            id: "charge".to_string(),
            node_type: NodeType::Tool,
            name: "Charge card".to_string(),
            config: Default::default(),
            retry,
            compensation: None,
            critical: None,
            timeout_ms: None,
        }
    }

    // -------------------------------------------------------------------
    // Profiles
    // -------------------------------------------------------------------

    #[test]
    fn test_profiles_return_fixed_baselines() {
        assert_eq!(
            resolve_policy("fast_safe", None).unwrap(),
            RetryPolicy {
                max_attempts: 2,
                backoff_ms: 300,
                max_backoff_ms: 2000,
                jitter_ratio: 0.05,
            }
        );
        for profile in RetryProfile::ALL {
            assert_eq!(
                resolve_policy(profile.as_str(), None).unwrap(),
                profile.policy()
            );
            assert!(validate_policy(&profile.policy()).is_ok());
        }
    }

    #[test]
    fn test_unknown_profile_is_error() {
        let err = get_profile("yolo").unwrap_err();
        assert_eq!(err, RetryPolicyError::UnknownProfile("yolo".to_string()));
        assert!(err.to_string().contains("yolo"));
    }

    #[test]
    fn test_overrides_win_field_by_field() {
        let overrides = RetryOverride {
            profile: None,
            max_attempts: Some(7),
            backoff_ms: None,
            max_backoff_ms: Some(9_000),
            jitter_ratio: Some(0.0),
        };
        let p = resolve_policy("fast_safe", Some(&overrides)).unwrap();
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.backoff_ms, 300);
        assert_eq!(p.max_backoff_ms, 9_000);
        assert_eq!(p.jitter_ratio, 0.0);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = RetryOverride {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            resolve_policy("balanced", Some(&overrides)),
            Err(RetryPolicyError::InvalidPolicy(_))
        ));

        let overrides = RetryOverride {
            backoff_ms: Some(5_000),
            max_backoff_ms: Some(1_000),
            ..Default::default()
        };
        assert!(resolve_policy("balanced", Some(&overrides)).is_err());
    }

    // -------------------------------------------------------------------
    // Delay
    // -------------------------------------------------------------------

    #[test]
    fn test_delay_without_jitter_doubles_and_caps() {
        let p = policy(1_000, 5_000, 0.0);
        let delays: Vec<u64> = (1..=4).map(|a| compute_retry_delay(&p, a)).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000]);
    }

    #[test]
    fn test_delay_without_jitter_is_deterministic() {
        let p = policy(250, 60_000, 0.0);
        for attempt in 1..=10 {
            assert_eq!(compute_retry_delay(&p, attempt), compute_retry_delay(&p, attempt));
        }
    }

    #[test]
    fn test_delay_monotonic_up_to_cap() {
        let p = policy(300, 2_000, 0.0);
        let mut last = 0;
        for attempt in 1..=40 {
            let d = compute_retry_delay(&p, attempt);
            assert!(d >= last);
            assert!(d <= 2_000);
            last = d;
        }
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let p = policy(1_000, 5_000, 0.1);
        assert_eq!(compute_retry_delay_with(&p, 1, || 0.0), 900);
        assert_eq!(compute_retry_delay_with(&p, 1, || 1.0), 1_100);
        assert_eq!(compute_retry_delay_with(&p, 1, || 0.5), 1_000);

        let p = RetryProfile::FastSafe.policy();
        // 300 * 0.05 = 15
        assert_eq!(compute_retry_delay_with(&p, 1, || 0.0), 285);
        assert_eq!(compute_retry_delay_with(&p, 1, || 1.0), 315);
    }

    #[test]
    fn test_delay_rounds_to_nearest_ms() {
        let p = policy(333, 10_000, 0.05);
        // 333 - 16.65 = 316.35
        assert_eq!(compute_retry_delay_with(&p, 1, || 0.0), 316);
        // 333 + 16.65 = 349.65
        assert_eq!(compute_retry_delay_with(&p, 1, || 1.0), 350);
    }

    #[test]
    fn test_delay_huge_attempt_does_not_overflow() {
        let p = policy(1_000, 30_000, 0.0);
        assert_eq!(compute_retry_delay(&p, 200), 30_000);
    }

    #[test]
    fn test_random_jitter_stays_in_band() {
        let p = policy(1_000, 5_000, 0.2);
        for _ in 0..100 {
            let d = compute_retry_delay(&p, 1);
            assert!((800..=1_200).contains(&d), "delay {d} out of band");
        }
    }

    // -------------------------------------------------------------------
    // RetryHandler
    // -------------------------------------------------------------------

    #[test]
    fn test_should_retry_within_limit() {
        let p = policy(0, 0, 0.0);
        assert!(RetryHandler::should_retry(&p, 1));
        assert!(RetryHandler::should_retry(&p, 3));
        assert!(!RetryHandler::should_retry(&p, 4));
        assert!(!RetryHandler::should_retry(&p, 5));
    }

    #[test]
    fn test_policy_for_node_uses_fallback_profile() {
        let p = RetryHandler::policy_for_node(
            &WorkflowDefaults::default(),
            &node_with_retry(None),
            "fast_safe",
        )
        .unwrap();
        assert_eq!(p, RetryProfile::FastSafe.policy());
    }

    #[test]
    fn test_policy_for_node_layers_definition_then_node() {
        let defaults = WorkflowDefaults {
            retry: Some(RetryOverride {
                profile: Some("strict_enterprise".to_string()),
                backoff_ms: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };
        let node = node_with_retry(Some(RetryOverride {
            max_attempts: Some(2),
            ..Default::default()
        }));

        let p = RetryHandler::policy_for_node(&defaults, &node, "balanced").unwrap();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.backoff_ms, 10);
        assert_eq!(p.max_backoff_ms, 60_000);
    }

    #[test]
    fn test_policy_for_node_with_own_profile_ignores_definition_overrides() {
        let defaults = WorkflowDefaults {
            retry: Some(RetryOverride {
                backoff_ms: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };
        let node = node_with_retry(Some(RetryOverride {
            profile: Some("fast_safe".to_string()),
            ..Default::default()
        }));

        let p = RetryHandler::policy_for_node(&defaults, &node, "balanced").unwrap();
        assert_eq!(p, RetryProfile::FastSafe.policy());
    }

    #[test]
    fn test_policy_for_node_unknown_profile() {
        let node = node_with_retry(Some(RetryOverride {
            profile: Some("turbo".to_string()),
            ..Default::default()
        }));
        assert!(matches!(
            RetryHandler::policy_for_node(&WorkflowDefaults::default(), &node, "balanced"),
            Err(RetryPolicyError::UnknownProfile(_))
        ));
    }
}
