//! Stack status polling with growing intervals.

use super::heat::{StackInfo, StackService};
use crate::errors::DeployError;
use crate::retry::RetryPolicy;

/// Where a stack stands for the operation being waited on.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Ready(StackInfo),
    Gone,
    Failed(String),
}

fn reason(info: &StackInfo) -> String {
    match &info.stack_status_reason {
        Some(r) if !r.is_empty() => format!("{}: {}", info.stack_status, r),
        _ => info.stack_status.clone(),
    }
}

/// Classify a stack while waiting for create or update.
pub fn classify_ready(stack: Option<StackInfo>) -> PollOutcome {
    match stack {
        None => PollOutcome::Pending,
        Some(info) if info.stack_status.ends_with("_FAILED") => {
            PollOutcome::Failed(reason(&info))
        }
        Some(info)
            if info.stack_status.ends_with("_COMPLETE")
                && !info.stack_status.starts_with("DELETE") =>
        {
            PollOutcome::Ready(info)
        }
        Some(_) => PollOutcome::Pending,
    }
}

/// Classify a stack while waiting for it to disappear.
pub fn classify_deleted(stack: Option<StackInfo>) -> PollOutcome {
    match stack {
        None => PollOutcome::Gone,
        Some(info) if info.stack_status == "DELETE_COMPLETE" => PollOutcome::Gone,
        Some(info) if info.stack_status == "DELETE_FAILED" => PollOutcome::Failed(reason(&info)),
        Some(_) => PollOutcome::Pending,
    }
}

async fn poll<F>(
    stacks: &dyn StackService,
    name: &str,
    policy: &RetryPolicy,
    classify: F,
) -> Result<(PollOutcome, u32), DeployError>
where
    F: Fn(Option<StackInfo>) -> PollOutcome,
{
    let max = policy.max_attempts.max(1);
    for attempt in 1..=max {
        let outcome = match stacks.get_stack(name).await {
            Ok(stack) => classify(stack),
            Err(e) => {
                tracing::warn!(stack = name, attempt, error = %e, "stack lookup failed");
                PollOutcome::Pending
            }
        };
        if outcome != PollOutcome::Pending {
            return Ok((outcome, attempt));
        }
        if attempt < max {
            let delay = policy.delay(attempt);
            tracing::debug!(stack = name, attempt, delay_ms = delay.as_millis() as u64, "stack pending");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
    Ok((PollOutcome::Pending, max))
}

/// Wait for a create or update to finish.
pub async fn wait_until_ready(
    stacks: &dyn StackService,
    name: &str,
    policy: &RetryPolicy,
) -> Result<StackInfo, DeployError> {
    match poll(stacks, name, policy, classify_ready).await? {
        (PollOutcome::Ready(info), _) => Ok(info),
        (PollOutcome::Failed(reason), _) => Err(DeployError::StackFailed {
            stack: name.to_string(),
            reason,
        }),
        (_, attempts) => Err(DeployError::StackTimedOut {
            stack: name.to_string(),
            attempts,
        }),
    }
}

/// Wait for a stack to be deleted.
pub async fn wait_until_deleted(
    stacks: &dyn StackService,
    name: &str,
    policy: &RetryPolicy,
) -> Result<(), DeployError> {
    match poll(stacks, name, policy, classify_deleted).await? {
        (PollOutcome::Gone, _) => Ok(()),
        (PollOutcome::Failed(reason), _) => Err(DeployError::StackDeleteFailed {
            stack: name.to_string(),
            reason,
        }),
        (_, attempts) => Err(DeployError::StackDeleteFailed {
            stack: name.to_string(),
            reason: format!("still present after {} polls", attempts),
        }),
    }
}
