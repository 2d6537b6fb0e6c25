//! Adapter-side failure classification.
//!
//! Transient failures never reach this point: the transport already retried
//! them on the same credential. What arrives here is either a credential
//! failure, which is reported to the pool and tagged, or something the
//! orchestrator surfaces unchanged.

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::error::{FailureClass, RelayError};

use super::AttemptContext;

/// What the adapter does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    RetrySameCredential,
    RotateCredential,
    Fatal,
}

#[must_use]
pub fn action_for(err: &RelayError) -> FailureAction {
    match err.failure_class() {
        FailureClass::Transient => FailureAction::RetrySameCredential,
        FailureClass::CredentialExhausted => FailureAction::RotateCredential,
        FailureClass::ClientInvalid | FailureClass::Fatal => FailureAction::Fatal,
    }
}

/// Midnight UTC on the first day of the month after `now`. Quota-exhausted
/// credentials recover then.
#[must_use]
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Report a credential failure to the pool and tag it so the orchestrator
/// rotates without reporting it again. Other failures pass through untouched.
#[must_use]
pub fn report_failure(err: RelayError, ctx: &AttemptContext) -> RelayError {
    if action_for(&err) != FailureAction::RotateCredential || err.credential_reported() {
        return err;
    }
    let RelayError::Upstream { status, .. } = &err else {
        return err;
    };
    match status {
        402 => {
            let recover_at = next_month_start(Utc::now());
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = %ctx.provider,
                credential = %ctx.credential_id,
                %recover_at,
                "credential quota exhausted"
            );
            ctx.pool.mark_unhealthy_with_recovery(
                ctx.provider,
                &ctx.credential_id,
                "quota exhausted",
                recover_at,
            );
        }
        _ => {
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = %ctx.provider,
                credential = %ctx.credential_id,
                status,
                "credential rejected, flagging for refresh"
            );
            ctx.pool.mark_needs_refresh(ctx.provider, &ctx.credential_id);
        }
    }
    err.mark_reported()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_follow_status() {
        assert_eq!(action_for(&RelayError::upstream(429, "")), FailureAction::RetrySameCredential);
        assert_eq!(action_for(&RelayError::upstream(503, "")), FailureAction::RetrySameCredential);
        assert_eq!(action_for(&RelayError::Transport("reset".into())), FailureAction::RetrySameCredential);
        for status in [401, 402, 403] {
            assert_eq!(action_for(&RelayError::upstream(status, "")), FailureAction::RotateCredential);
        }
        assert_eq!(action_for(&RelayError::upstream(400, "")), FailureAction::Fatal);
        assert_eq!(action_for(&RelayError::upstream(404, "")), FailureAction::Fatal);
    }

    #[test]
    fn recovery_is_first_of_next_month() {
        let now = Utc.with_ymd_and_hms(2025, 12, 17, 8, 30, 0).unwrap();
        assert_eq!(next_month_start(now), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(next_month_start(now), Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap());
    }
}
