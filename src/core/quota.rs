use crate::domain::model::{QuotaEstimate, QuotaStatus, RiskLevel};
use crate::utils::error::{HarvestError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const PER_SECOND_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily_limit: u64,
    pub per_second_limit: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily_limit: 5000,
            per_second_limit: 5,
        }
    }
}

/// `try_reserve_detailed` 的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Admitted,
    /// 本秒額度已滿；`retry_after` 後視窗重置
    PerSecondExhausted { retry_after: Duration },
    DailyExhausted,
}

#[derive(Debug)]
struct QuotaState {
    daily_used: u64,
    per_second_used: u32,
    window_start: Instant,
    last_daily_reset: DateTime<Utc>,
}

/// 每日與每秒呼叫額度。檢查與遞增在同一個鎖內完成，併發保留不會超額。
#[derive(Debug)]
pub struct QuotaBudget {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
}

impl QuotaBudget {
    pub fn new(limits: QuotaLimits) -> Self {
        Self::with_usage(limits, 0)
    }

    /// 以既有的當日用量建立 (例如同一天內重新啟動程式)
    pub fn with_usage(limits: QuotaLimits, daily_used: u64) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState {
                daily_used: daily_used.min(limits.daily_limit),
                per_second_used: 0,
                window_start: Instant::now(),
                last_daily_reset: Utc::now(),
            }),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn roll_windows(&self, state: &mut QuotaState) {
        let now = Utc::now();
        if now - state.last_daily_reset >= ChronoDuration::hours(24) {
            tracing::info!(
                "🔄 Daily quota reset ({} calls used since {})",
                state.daily_used,
                state.last_daily_reset
            );
            state.daily_used = 0;
            state.last_daily_reset = now;
        }
        if state.window_start.elapsed() >= PER_SECOND_WINDOW {
            state.per_second_used = 0;
            state.window_start = Instant::now();
        }
    }

    pub fn try_reserve(&self) -> bool {
        self.try_reserve_detailed() == Reservation::Admitted
    }

    pub fn try_reserve_detailed(&self) -> Reservation {
        let mut state = self.lock();
        self.roll_windows(&mut state);

        if state.daily_used >= self.limits.daily_limit {
            return Reservation::DailyExhausted;
        }
        if state.per_second_used >= self.limits.per_second_limit {
            let retry_after = PER_SECOND_WINDOW.saturating_sub(state.window_start.elapsed());
            return Reservation::PerSecondExhausted { retry_after };
        }

        state.daily_used += 1;
        state.per_second_used += 1;
        Reservation::Admitted
    }

    pub fn status(&self) -> QuotaStatus {
        let mut state = self.lock();
        self.roll_windows(&mut state);
        QuotaStatus {
            daily_used: state.daily_used,
            daily_remaining: self.limits.daily_limit.saturating_sub(state.daily_used),
            daily_limit: self.limits.daily_limit,
            per_second_used: state.per_second_used,
            per_second_remaining: self
                .limits
                .per_second_limit
                .saturating_sub(state.per_second_used),
            per_second_limit: self.limits.per_second_limit,
            last_daily_reset: state.last_daily_reset,
        }
    }

    /// 估算一批格子會用掉多少呼叫，並依佔剩餘額度的比例分級
    pub fn estimate(
        &self,
        cell_count: usize,
        avg_probes_per_cell: f64,
        avg_pages_per_probe: f64,
    ) -> QuotaEstimate {
        let estimated_calls =
            (cell_count as f64 * avg_probes_per_cell.max(0.0) * avg_pages_per_probe.max(0.0)).ceil()
                as u64;
        let daily_remaining = self.status().daily_remaining;
        classify(estimated_calls, daily_remaining)
    }

    /// 估算為 critical 時整批拒絕，不做部分執行
    pub fn ensure_can_process(&self, estimate: &QuotaEstimate) -> Result<()> {
        if estimate.can_process {
            return Ok(());
        }
        Err(HarvestError::QuotaExceeded {
            estimated_calls: estimate.estimated_calls,
            daily_remaining: estimate.daily_remaining,
            message: estimate.recommendation.clone(),
        })
    }

    /// 清除所有計數 (測試隔離用)
    pub fn reset(&self) {
        let mut state = self.lock();
        state.daily_used = 0;
        state.per_second_used = 0;
        state.window_start = Instant::now();
        state.last_daily_reset = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate_daily_reset(&self, by: ChronoDuration) {
        let mut state = self.lock();
        state.last_daily_reset -= by;
    }
}

pub fn classify(estimated_calls: u64, daily_remaining: u64) -> QuotaEstimate {
    let usage_ratio = if daily_remaining == 0 {
        if estimated_calls == 0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        estimated_calls as f64 / daily_remaining as f64
    };

    let risk_level = if daily_remaining == 0 && estimated_calls > 0 {
        RiskLevel::Critical
    } else if usage_ratio < 0.4 {
        RiskLevel::Low
    } else if usage_ratio < 0.6 {
        RiskLevel::Medium
    } else if usage_ratio <= 0.8 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    };

    let recommendation = match risk_level {
        RiskLevel::Low => "Safe to proceed".to_string(),
        RiskLevel::Medium => "Proceed, but monitor the remaining daily quota".to_string(),
        RiskLevel::High => {
            "Proceed with caution; consider splitting the batch across days".to_string()
        }
        RiskLevel::Critical => format!(
            "Do not proceed: ~{} calls needed but only {} remain today",
            estimated_calls, daily_remaining
        ),
    };

    QuotaEstimate {
        estimated_calls,
        daily_remaining,
        usage_ratio,
        risk_level,
        can_process: risk_level != RiskLevel::Critical,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limits(daily: u64, per_second: u32) -> QuotaLimits {
        QuotaLimits {
            daily_limit: daily,
            per_second_limit: per_second,
        }
    }

    #[test]
    fn test_reserve_counts_against_both_ceilings() {
        let budget = QuotaBudget::new(limits(10, 2));
        assert!(budget.try_reserve());
        assert!(budget.try_reserve());
        assert!(matches!(
            budget.try_reserve_detailed(),
            Reservation::PerSecondExhausted { .. }
        ));

        let status = budget.status();
        assert_eq!(status.daily_used, 2);
        assert_eq!(status.daily_remaining, 8);
        assert_eq!(status.per_second_remaining, 0);
    }

    #[test]
    fn test_daily_ceiling_blocks() {
        let budget = QuotaBudget::with_usage(limits(3, 100), 3);
        assert_eq!(budget.try_reserve_detailed(), Reservation::DailyExhausted);
        assert_eq!(budget.status().daily_used, 3);
    }

    #[test]
    fn test_daily_counter_resets_after_a_day() {
        let budget = QuotaBudget::with_usage(limits(3, 100), 3);
        budget.backdate_daily_reset(ChronoDuration::hours(25));
        assert!(budget.try_reserve());
        assert_eq!(budget.status().daily_used, 1);
    }

    #[tokio::test]
    async fn test_per_second_window_reopens() {
        let budget = QuotaBudget::new(limits(100, 1));
        assert!(budget.try_reserve());
        let retry_after = match budget.try_reserve_detailed() {
            Reservation::PerSecondExhausted { retry_after } => retry_after,
            other => panic!("unexpected {:?}", other),
        };
        tokio::time::sleep(retry_after + Duration::from_millis(20)).await;
        assert!(budget.try_reserve());
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_remaining() {
        let budget = Arc::new(QuotaBudget::with_usage(limits(100, 10_000), 63));
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || budget.try_reserve())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 37);
        assert_eq!(budget.status().daily_used, 100);
    }

    #[test]
    fn test_estimate_critical_when_remaining_is_short() {
        let budget = QuotaBudget::with_usage(limits(100, 5), 95);
        let estimate = budget.estimate(10, 1.0, 1.0);
        assert_eq!(estimate.estimated_calls, 10);
        assert_eq!(estimate.risk_level, RiskLevel::Critical);
        assert!(!estimate.can_process);
        assert!(budget.ensure_can_process(&estimate).is_err());
    }

    #[test]
    fn test_estimate_tiers() {
        assert_eq!(classify(30, 100).risk_level, RiskLevel::Low);
        assert_eq!(classify(40, 100).risk_level, RiskLevel::Medium);
        assert_eq!(classify(60, 100).risk_level, RiskLevel::High);
        assert_eq!(classify(80, 100).risk_level, RiskLevel::High);
        assert_eq!(classify(81, 100).risk_level, RiskLevel::Critical);
        assert_eq!(classify(1, 0).risk_level, RiskLevel::Critical);
        assert!(classify(0, 0).can_process);
    }

    #[test]
    fn test_estimate_rounds_up_fractional_calls() {
        let budget = QuotaBudget::new(limits(1000, 5));
        let estimate = budget.estimate(3, 3.0, 1.5);
        assert_eq!(estimate.estimated_calls, 14);
        assert_eq!(estimate.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_reset_clears_usage() {
        let budget = QuotaBudget::with_usage(limits(10, 5), 7);
        budget.reset();
        assert_eq!(budget.status().daily_used, 0);
    }
}
