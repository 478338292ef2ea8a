//! Working-hours gate.
//!
//! A handler is allowed to act only inside `[utc_time_on, utc_time_off]`
//! (and, when time blocks are given, inside one of those blocks too).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::timeline::model::{SECONDS_PER_DAY, TimeOfDay, TimelineHandler};

/// Longest single sleep while waiting for the window to open.
pub const MAX_GATE_SLEEP: Duration = Duration::from_secs(5 * 60);

/// How long to wait before `now` falls inside the handler's window.
/// `None` means the handler may act right away.
pub fn time_until_window(handler: &TimelineHandler, now: TimeOfDay) -> Option<Duration> {
    let wait = window_wait(handler.utc_time_on, handler.utc_time_off, now)
        .or_else(|| block_wait(&handler.utc_time_blocks, now))?;
    Some(Duration::from_secs(u64::from(wait.max(1))))
}

/// Seconds until the on/off window opens, or `None` when inside.
fn window_wait(on: TimeOfDay, off: TimeOfDay, now: TimeOfDay) -> Option<u32> {
    let (on, off, now) = (on.seconds(), off.seconds(), now.seconds());
    if on == off {
        // 00:00 to 00:00 (or any zero-width window) means no restriction.
        return None;
    }

    if within(on, off, now) {
        None
    } else if now < on {
        Some(on - now)
    } else {
        Some(SECONDS_PER_DAY - now + on)
    }
}

/// Whether `now` lies in `[start, end]`. A range with `end < start` wraps midnight.
fn within(start: u32, end: u32, now: u32) -> bool {
    if end < start {
        now >= start || now <= end
    } else {
        start <= now && now <= end
    }
}

/// Seconds until the next time block starts, or `None` when inside one (or no blocks).
fn block_wait(blocks: &[TimeOfDay], now: TimeOfDay) -> Option<u32> {
    if blocks.len() < 2 {
        return None;
    }
    let now = now.seconds();
    let pairs: Vec<(u32, u32)> = blocks
        .chunks_exact(2)
        .map(|pair| (pair[0].seconds(), pair[1].seconds()))
        .collect();

    if pairs.iter().any(|&(start, end)| within(start, end, now)) {
        return None;
    }

    let next_today = pairs.iter().map(|&(start, _)| start).filter(|&s| s > now).min();
    match next_today {
        Some(start) => Some(start - now),
        None => pairs
            .iter()
            .map(|&(start, _)| start)
            .min()
            .map(|start| SECONDS_PER_DAY - now + start),
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Block until the handler is inside its working hours. Returns `false` if
/// cancelled while waiting.
pub async fn wait_for_window(handler: &TimelineHandler, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(wait) = time_until_window(handler, TimeOfDay::now_utc()) else {
            return true;
        };
        tracing::debug!(
            handler = %handler.handler_type,
            wait_secs = wait.as_secs(),
            "Outside working hours, sleeping"
        );
        if !sleep_or_cancel(wait.min(MAX_GATE_SLEEP), cancel).await {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::model::HandlerType;

    fn handler(on: &str, off: &str) -> TimelineHandler {
        let mut h = TimelineHandler::new(HandlerType::Command);
        h.utc_time_on = on.parse().unwrap();
        h.utc_time_off = off.parse().unwrap();
        h
    }

    fn at(hms: &str) -> TimeOfDay {
        hms.parse().unwrap()
    }

    #[test]
    fn no_window_means_always_open() {
        let h = handler("00:00:00", "00:00:00");
        assert_eq!(time_until_window(&h, at("03:00:00")), None);
        assert_eq!(time_until_window(&h, at("23:59:59")), None);
    }

    #[test]
    fn daytime_window() {
        let h = handler("08:00:00", "17:00:00");
        assert_eq!(time_until_window(&h, at("12:00:00")), None);
        assert_eq!(
            time_until_window(&h, at("07:00:00")),
            Some(Duration::from_secs(3600))
        );
        // After hours: wait until 08:00 tomorrow.
        assert_eq!(
            time_until_window(&h, at("18:00:00")),
            Some(Duration::from_secs(14 * 3600))
        );
    }

    #[test]
    fn overnight_window() {
        let h = handler("22:00:00", "06:00:00");
        assert_eq!(time_until_window(&h, at("23:30:00")), None);
        assert_eq!(time_until_window(&h, at("02:00:00")), None);
        assert_eq!(
            time_until_window(&h, at("12:00:00")),
            Some(Duration::from_secs(10 * 3600))
        );
    }

    #[test]
    fn time_blocks_restrict_further() {
        let mut h = handler("00:00:00", "24:00:00");
        h.utc_time_blocks = vec![at("09:00"), at("10:00"), at("14:00"), at("15:00")];
        assert_eq!(time_until_window(&h, at("09:30")), None);
        assert_eq!(
            time_until_window(&h, at("11:00")),
            Some(Duration::from_secs(3 * 3600))
        );
        assert_eq!(
            time_until_window(&h, at("16:00")),
            Some(Duration::from_secs(17 * 3600))
        );
    }

    #[test]
    fn time_block_across_midnight() {
        let mut h = handler("00:00:00", "00:00:00");
        h.utc_time_blocks = vec![at("22:00"), at("02:00")];
        assert_eq!(time_until_window(&h, at("23:00")), None);
        assert_eq!(time_until_window(&h, at("01:30")), None);
        assert_eq!(
            time_until_window(&h, at("12:00")),
            Some(Duration::from_secs(10 * 3600))
        );
    }

    #[tokio::test]
    async fn wait_returns_false_when_cancelled() {
        // A window that is never open "now" is hard to build without a clock,
        // so cancel up front and check the wait refuses to proceed.
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_for_window(&handler("00:00:00", "00:00:00"), &cancel).await);
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            sleep_or_cancel(Duration::from_secs(600), &cancel),
        )
        .await
        .unwrap();
        assert!(!finished);
    }
}
