//! Cron sub-scheduler for handlers with `ScheduleType::Cron`.
//!
//! Expressions are seconds-first (`sec min hour dom month dow [year]`). A plain
//! five-field expression is accepted and fires at second 0.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::TimelineError;
use crate::scheduler::unit::{Interrupted, UnitContext, UnitExit, run_pass};
use crate::timeline::working_hours::sleep_or_cancel;

/// Parse a cron expression.
pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, TimelineError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| TimelineError::InvalidSchedule {
        schedule: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time after now, if the schedule has one.
pub fn next_fire(schedule: &cron::Schedule) -> Option<DateTime<Utc>> {
    schedule.upcoming(Utc).next()
}

/// Run one pass of the handler's events at every fire time until cancelled.
pub async fn run_cron(ctx: UnitContext, schedule: cron::Schedule) -> UnitExit {
    let mut total = 0;
    tracing::info!(
        job_id = %ctx.job_id,
        handler = %ctx.definition.handler_type,
        "Cron job registered"
    );

    loop {
        let Some(next) = next_fire(&schedule) else {
            tracing::info!(job_id = %ctx.job_id, "Cron schedule has no further fire times");
            return UnitExit::Completed { executions: total };
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(job_id = %ctx.job_id, next = %next, "Waiting for next cron fire");
        if !sleep_or_cancel(wait, &ctx.cancel).await {
            return UnitExit::Cancelled { executions: total };
        }

        match run_pass(&ctx).await {
            Ok(executions) => total += executions,
            Err(Interrupted(executions)) => {
                return UnitExit::Cancelled {
                    executions: total + executions,
                };
            }
        }
    }
}
