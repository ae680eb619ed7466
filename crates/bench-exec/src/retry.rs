//! Bounded retry over a boolean predicate, used by health checks.

use std::time::Duration;

use crate::{Context, Result};

/// Run `predicate` up to `retries + 1` times, sleeping `base_delay`
/// between attempts. A predicate error is returned immediately; the
/// context being done aborts the loop. `Ok(false)` means every attempt
/// reported "not yet".
pub fn call_with_retry<F>(
    ctx: &Context,
    mut predicate: F,
    retries: u32,
    base_delay: Duration,
) -> Result<bool>
where
    F: FnMut() -> Result<bool>,
{
    let attempts = retries.saturating_add(1);
    for attempt in 0..attempts {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if predicate()? {
            return Ok(true);
        }
        if attempt + 1 < attempts {
            ctx.sleep(base_delay)?;
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecError;

    #[test]
    fn zero_retries_means_single_attempt() {
        let mut calls = 0;
        let ok = call_with_retry(
            &Context::background(),
            || {
                calls += 1;
                Ok(false)
            },
            0,
            Duration::ZERO,
        )
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_once_predicate_turns_true() {
        let mut calls = 0;
        let ok = call_with_retry(
            &Context::background(),
            || {
                calls += 1;
                Ok(calls >= 3)
            },
            5,
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn predicate_error_is_returned_immediately() {
        let mut calls = 0;
        let err = call_with_retry(
            &Context::background(),
            || {
                calls += 1;
                Err(ExecError::ProbeMissing("nc"))
            },
            5,
            Duration::from_millis(1),
        )
        .expect_err("error must propagate");
        assert!(matches!(err, ExecError::ProbeMissing("nc")));
        assert_eq!(calls, 1);
    }

    #[test]
    fn exhausted_retries_report_false() {
        let mut calls = 0;
        let ok = call_with_retry(
            &Context::background(),
            || {
                calls += 1;
                Ok(false)
            },
            4,
            Duration::from_millis(1),
        )
        .unwrap();
        assert!(!ok);
        assert_eq!(calls, 5);
    }

    #[test]
    fn cancelled_context_aborts_before_first_attempt() {
        let ctx = Context::background();
        ctx.cancel();
        let mut calls = 0;
        let err = call_with_retry(
            &ctx,
            || {
                calls += 1;
                Ok(false)
            },
            5,
            Duration::from_millis(1),
        )
        .expect_err("cancelled context must abort");
        assert!(matches!(err, ExecError::Cancelled));
        assert_eq!(calls, 0);
    }
}
