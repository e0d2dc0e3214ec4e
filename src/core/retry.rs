use crate::utils::error::{HarvestError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// 指數退避 + 隨機抖動的重試策略，與具體操作無關
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    retry_any: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            retry_any: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 不只重試暫時性錯誤 (用於明確的失敗格子重掃)
    pub fn retry_on_any_error(mut self) -> Self {
        self.retry_any = true;
        self
    }

    fn should_retry(&self, err: &HarvestError) -> bool {
        match err {
            // 額度用完或被取消時重試沒有意義
            HarvestError::QuotaExceeded { .. } | HarvestError::Cancelled => false,
            _ => self.retry_any || err.is_retryable(),
        }
    }

    /// 第 `attempt` 次失敗後的等待時間 (attempt 從 1 開始)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = match self.base_delay.as_millis() as u64 {
            0 => 0,
            base => rand::thread_rng().gen_range(0..base),
        };
        exp.saturating_add(Duration::from_millis(jitter_ms))
            .min(self.max_delay)
    }

    /// 執行 `operation`，失敗且可重試時依退避時間重來；`operation` 收到目前的嘗試次數
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && self.should_retry(&err) => {
                    let delay = err
                        .retry_after()
                        .map(|d| d.min(self.max_delay))
                        .unwrap_or_else(|| self.delay_for(attempt));
                    tracing::debug!(
                        "🔁 Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// 以指定次數與基礎延遲包裝任意操作
pub async fn with_retry<T, F, Fut>(operation: F, max_attempts: u32, base_delay: Duration) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::new(max_attempts, base_delay).run(operation).await
}
