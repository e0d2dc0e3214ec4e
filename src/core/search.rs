use crate::core::rate_gate::RateGate;
use crate::core::retry::RetryPolicy;
use crate::core::subdivision::dedup_items;
use crate::domain::model::{Cell, CellResult, ExternalItem, ProbeResult, SearchProbe, SearchStatus};
use crate::domain::ports::{GridIndex, SearchApi, SearchPage, SearchRequest};
use crate::utils::error::{HarvestError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 大多數圓形搜尋 API 接受的最大半徑
pub const MAX_RADIUS_M: u32 = 40_000;

/// 經由 [`RateGate`] 對每個探針做分頁查詢，再合併、去重並依格子驗證
pub struct SearchClient<A: SearchApi, G: GridIndex> {
    api: Arc<A>,
    grid: Arc<G>,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
}

/// 單一探針分頁過程中的狀態
struct ProbeFetch {
    result: ProbeResult,
    calls: u64,
    quota_error: Option<HarvestError>,
    cancelled: bool,
}

impl<A: SearchApi, G: GridIndex> SearchClient<A, G> {
    pub fn new(api: Arc<A>, grid: Arc<G>, gate: Arc<RateGate>, retry: RetryPolicy) -> Self {
        Self {
            api,
            grid,
            gate,
            retry,
        }
    }

    /// 依計畫順序查詢所有探針。
    ///
    /// 只有每日額度耗盡時回傳 `Err(QuotaExceeded)`；其他失敗都記錄在 [`CellResult`] 裡。
    pub async fn search_cell(
        &self,
        cell: &Cell,
        probes: &[SearchProbe],
        cancel: &CancellationToken,
    ) -> Result<CellResult> {
        let mut per_probe_results = Vec::with_capacity(probes.len());
        let mut api_calls = 0;
        let mut cancelled = false;

        for probe in probes {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let fetch = self.fetch_probe(probe, cancel).await;
            api_calls += fetch.calls;
            cancelled |= fetch.cancelled;
            if let Some(err) = fetch.quota_error {
                tracing::warn!("🛑 {}: quota exhausted after {} calls", cell.id, api_calls);
                return Err(err);
            }
            per_probe_results.push(fetch.result);
            if cancelled {
                break;
            }
        }

        let merged = dedup_items(
            per_probe_results
                .iter()
                .flat_map(|r| r.items.iter().cloned()),
        );
        let (unique_items, leaked_items, validation_failures) = self.validate_items(cell, merged);

        let succeeded = per_probe_results.iter().filter(|r| r.error.is_none()).count();
        let first_error = per_probe_results.iter().find_map(|r| r.error.clone());
        let status = if succeeded == 0 {
            SearchStatus::Failed
        } else if succeeded < probes.len() {
            SearchStatus::Partial
        } else {
            SearchStatus::Success
        };
        let error = match status {
            SearchStatus::Success => None,
            _ if cancelled => Some(HarvestError::Cancelled.to_string()),
            _ => first_error,
        };

        tracing::debug!(
            "🔎 {}: {} probes, {} unique items ({} leaked, {} unvalidated), {} calls, {:?}",
            cell.id,
            per_probe_results.len(),
            unique_items.len(),
            leaked_items.len(),
            validation_failures,
            api_calls,
            status
        );

        Ok(CellResult {
            cell_id: cell.id.clone(),
            total_count: unique_items.len(),
            unique_items,
            per_probe_results,
            status,
            error,
            leaked_items,
            validation_failures,
            api_calls,
            cancelled,
        })
    }

    async fn fetch_probe(&self, probe: &SearchProbe, cancel: &CancellationToken) -> ProbeFetch {
        let page_size = self.api.page_size().max(1);
        let max_offset = self.api.max_offset();
        let radius_m = (probe.radius_m.round() as u32).clamp(1, MAX_RADIUS_M);

        let mut fetch = ProbeFetch {
            result: ProbeResult {
                probe: probe.clone(),
                reported_total: 0,
                pages_fetched: 0,
                items: Vec::new(),
                truncated: false,
                error: None,
            },
            calls: 0,
            quota_error: None,
            cancelled: false,
        };

        let mut offset = 0;
        loop {
            let request = SearchRequest {
                lat: probe.center.lat,
                lng: probe.center.lng,
                radius_m,
                offset,
                limit: page_size,
            };

            match self.fetch_page(&request, &mut fetch.calls).await {
                Ok(page) => {
                    fetch.result.pages_fetched += 1;
                    if offset == 0 {
                        fetch.result.reported_total = page.total;
                    }
                    let received = page.items.len();
                    fetch.result.items.extend(page.items);

                    let next = offset.saturating_add(page_size);
                    if received == 0 || next as usize >= fetch.result.reported_total {
                        break;
                    }
                    if next >= max_offset {
                        fetch.result.truncated = true;
                        tracing::debug!(
                            "📄 {}: pagination ceiling reached at offset {} (total {})",
                            probe.description,
                            next,
                            fetch.result.reported_total
                        );
                        break;
                    }
                    // 只在頁與頁之間檢查取消，不中斷進行中的請求
                    if cancel.is_cancelled() {
                        fetch.cancelled = true;
                        break;
                    }
                    offset = next;
                }
                Err(err @ HarvestError::QuotaExceeded { .. }) => {
                    fetch.quota_error = Some(err);
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        "⚠️ {} failed at offset {}: {}",
                        probe.description,
                        offset,
                        err
                    );
                    fetch.result.error = Some(err.to_string());
                    break;
                }
            }
        }

        fetch.result.items = dedup_items(std::mem::take(&mut fetch.result.items));
        fetch
    }

    /// 每次嘗試 (含重試) 都要先取得一個呼叫額度
    async fn fetch_page(&self, request: &SearchRequest, calls: &mut u64) -> Result<SearchPage> {
        let attempts = AtomicU64::new(0);
        let (gate, api, counter) = (&self.gate, &self.api, &attempts);
        let result = self
            .retry
            .run(|_| async move {
                gate.wait_for_slot().await?;
                counter.fetch_add(1, Ordering::SeqCst);
                api.search(request).await
            })
            .await;
        *calls += attempts.load(Ordering::SeqCst);
        result
    }

    /// 剔除座標屬於其他格子的資料；查詢失敗時保留 (fail-open)
    fn validate_items(
        &self,
        cell: &Cell,
        items: Vec<ExternalItem>,
    ) -> (Vec<ExternalItem>, Vec<ExternalItem>, usize) {
        let mut kept = Vec::with_capacity(items.len());
        let mut leaked = Vec::new();
        let mut failures = 0;

        for item in items {
            let Some(point) = item.coordinates else {
                kept.push(item);
                continue;
            };
            match self.grid.point_to_cell(point.lat, point.lng, cell.resolution) {
                Ok(owner) if owner == cell.id => kept.push(item),
                Ok(owner) => {
                    tracing::trace!("↪️ {} belongs to {}, not {}", item.id, owner, cell.id);
                    leaked.push(item);
                }
                Err(e) => {
                    let err = HarvestError::BoundaryValidation {
                        item_id: item.id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::trace!("{}", err);
                    failures += 1;
                    kept.push(item);
                }
            }
        }

        (kept, leaked, failures)
    }
}
