use crate::core::quota::{QuotaBudget, Reservation};
use crate::utils::error::{HarvestError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

/// 先進先出的呼叫閘門。
///
/// tokio 的 `Mutex` 依到達順序喚醒等待者，因此持有鎖的呼叫者就是佇列頭；
/// 只有它會向 [`QuotaBudget`] 保留額度，後面的人不會插隊。
pub struct RateGate {
    budget: Arc<QuotaBudget>,
    min_interval: Duration,
    last_admission: AsyncMutex<Option<Instant>>,
    waiting: AtomicUsize,
    admitted: AtomicUsize,
}

impl RateGate {
    pub fn new(budget: Arc<QuotaBudget>) -> Self {
        let per_second = budget.limits().per_second_limit.max(1);
        let min_interval = Duration::from_secs_f64(1.0 / f64::from(per_second));
        Self {
            budget,
            min_interval,
            last_admission: AsyncMutex::new(None),
            waiting: AtomicUsize::new(0),
            admitted: AtomicUsize::new(0),
        }
    }

    pub fn budget(&self) -> &Arc<QuotaBudget> {
        &self.budget
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 目前在佇列中等待的呼叫者數量
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }

    /// 等到輪到自己且額度足夠才返回。每日額度用完時立即回傳 `QuotaExceeded`，不會空轉輪詢。
    pub async fn wait_for_slot(&self) -> Result<()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.admit().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub async fn wait_for_slot_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait_for_slot()).await {
            Ok(result) => result,
            Err(_) => {
                let status = self.budget.status();
                Err(HarvestError::QuotaExceeded {
                    estimated_calls: 1,
                    daily_remaining: status.daily_remaining,
                    message: format!("no call slot became available within {:?}", timeout),
                })
            }
        }
    }

    async fn admit(&self) -> Result<()> {
        let mut last = self.last_admission.lock().await;
        loop {
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < self.min_interval {
                    sleep(self.min_interval - elapsed).await;
                }
            }

            match self.budget.try_reserve_detailed() {
                Reservation::Admitted => {
                    *last = Some(Instant::now());
                    self.admitted.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Reservation::PerSecondExhausted { retry_after } => {
                    tracing::trace!("⏳ Per-second ceiling reached, waiting {:?}", retry_after);
                    sleep(retry_after.max(Duration::from_millis(1))).await;
                }
                Reservation::DailyExhausted => {
                    let status = self.budget.status();
                    tracing::warn!(
                        "🛑 Daily quota exhausted ({}/{})",
                        status.daily_used,
                        status.daily_limit
                    );
                    return Err(HarvestError::QuotaExceeded {
                        estimated_calls: 1,
                        daily_remaining: status.daily_remaining,
                        message: "daily call ceiling reached".to_string(),
                    });
                }
            }
        }
    }
}
