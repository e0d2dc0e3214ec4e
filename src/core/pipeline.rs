use crate::core::coverage::CoveragePlanner;
use crate::core::quota::QuotaBudget;
use crate::core::rate_gate::RateGate;
use crate::core::retry::RetryPolicy;
use crate::core::search::SearchClient;
use crate::core::subdivision::{
    CellOutcome, ParentChildIndex, SubdivisionManager, DEFAULT_DENSE_THRESHOLD,
    DEFAULT_MAX_RESOLUTION,
};
use crate::domain::model::{
    Cell, CellId, CellResult, CellStatus, CoverageLabel, CoverageQuality, ExternalItem,
    FailedCell, MergeCoverage, MergeResult, PipelineReport, ProcessingStats, QuotaEstimate,
    QuotaStatus, ResolutionStats, SearchStatus,
};
use crate::domain::ports::{GridIndex, SearchApi};
use crate::utils::error::{HarvestError, Result};
use crate::utils::monitor::PhaseMonitor;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// 同一階段內同時處理的格子數
    pub concurrency: usize,
    pub dense_threshold: usize,
    pub max_resolution: u8,
    /// 第二階段仍過密的子格子是否繼續往下切
    pub recursive_split: bool,
    pub avg_probes_per_cell: f64,
    pub avg_pages_per_probe: f64,
    /// 單頁請求遇到暫時性錯誤時的重試策略
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dense_threshold: DEFAULT_DENSE_THRESHOLD,
            max_resolution: DEFAULT_MAX_RESOLUTION,
            recursive_split: true,
            avg_probes_per_cell: 3.0,
            avg_pages_per_probe: 2.0,
            retry: RetryPolicy::default(),
        }
    }
}

/// 匯出用：資料與其所屬的格子。越界且沒有被任何格子收下的資料 `cell_id` 為空。
#[derive(Debug, Clone, Serialize)]
pub struct HarvestedItem {
    pub cell_id: Option<CellId>,
    pub item: ExternalItem,
}

/// 一次執行 (或多次執行累積) 的所有狀態，只在 worker 完成之間被修改
#[derive(Debug, Default)]
struct PipelineState {
    cells: BTreeMap<CellId, Cell>,
    phase_two_queue: VecDeque<CellId>,
    index: ParentChildIndex,
    outcomes: HashMap<CellId, CellOutcome>,
    merges: BTreeMap<CellId, MergeResult>,
    /// 全部去重後的資料，包含越界資料
    run_items: HashMap<String, ExternalItem>,
    leaked_ids: HashSet<String>,
    probes_issued: u64,
    items_leaked: u64,
    validation_failures: u64,
}

pub struct PipelineOrchestrator<A: SearchApi, G: GridIndex> {
    grid: Arc<G>,
    planner: CoveragePlanner<G>,
    search: SearchClient<A, G>,
    subdivision: SubdivisionManager<G>,
    budget: Arc<QuotaBudget>,
    gate: Arc<RateGate>,
    settings: PipelineSettings,
    monitor: PhaseMonitor,
    state: Mutex<PipelineState>,
    cancel: Mutex<CancellationToken>,
    calls_baseline: AtomicUsize,
}

impl<A: SearchApi, G: GridIndex> PipelineOrchestrator<A, G> {
    pub fn new(
        api: Arc<A>,
        grid: Arc<G>,
        budget: Arc<QuotaBudget>,
        settings: PipelineSettings,
    ) -> Self {
        let gate = Arc::new(RateGate::new(Arc::clone(&budget)));
        Self {
            planner: CoveragePlanner::new(Arc::clone(&grid)),
            search: SearchClient::new(
                api,
                Arc::clone(&grid),
                Arc::clone(&gate),
                settings.retry,
            ),
            subdivision: SubdivisionManager::new(Arc::clone(&grid))
                .with_threshold(settings.dense_threshold)
                .with_max_resolution(settings.max_resolution),
            grid,
            budget,
            gate,
            settings,
            monitor: PhaseMonitor::default(),
            state: Mutex::new(PipelineState::default()),
            cancel: Mutex::new(CancellationToken::new()),
            calls_baseline: AtomicUsize::new(0),
        }
    }

    pub fn with_monitor(mut self, monitor: PhaseMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &PhaseMonitor {
        &self.monitor
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resumable(cell: &Cell) -> bool {
        cell.is_top_level() && cell.status() == CellStatus::Queued
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 預估處理 `cell_count` 個頂層格子需要的呼叫數
    pub fn estimate(&self, cell_count: usize) -> QuotaEstimate {
        self.budget.estimate(
            cell_count,
            self.settings.avg_probes_per_cell,
            self.settings.avg_pages_per_probe,
        )
    }

    /// 兩階段處理一批頂層格子。
    ///
    /// 預估額度不足時整批拒絕並回傳 `QuotaExceeded`；其餘情況一律回傳報告，
    /// 失敗的格子列在報告中。
    pub async fn run_pipeline(&self, top_level_ids: &[String]) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let token = self.token().child_token();

        let new_cells = self.materialize_top_level(top_level_ids);
        // 已追蹤且仍在排隊的頂層格子 (例如被取消的上一輪) 會重新處理
        let valid = {
            let state = self.state();
            new_cells
                .iter()
                .filter(|c| c.status() == CellStatus::Queued)
                .filter(|c| {
                    state
                        .cells
                        .get(&c.id)
                        .map_or(true, |tracked| Self::resumable(tracked))
                })
                .count()
        };

        let estimate = self.estimate(valid);
        tracing::info!(
            "📊 Quota estimate: ~{} calls for {} cells, {} remaining today ({:?})",
            estimate.estimated_calls,
            valid,
            estimate.daily_remaining,
            estimate.risk_level
        );
        if let Err(e) = self.budget.ensure_can_process(&estimate) {
            tracing::error!("🛑 {}", estimate.recommendation);
            return Err(e);
        }

        let batch: Vec<Cell> = {
            let mut state = self.state();
            let mut batch = Vec::new();
            for mut cell in new_cells {
                if let Some(tracked) = state.cells.get_mut(&cell.id) {
                    if Self::resumable(tracked) {
                        tracing::info!("↩️ Resuming queued cell {}", tracked.id);
                        tracked.start_processing();
                        batch.push(tracked.clone());
                    } else {
                        tracing::debug!("⏭️ {} already tracked, skipping", cell.id);
                    }
                    continue;
                }
                if cell.status() == CellStatus::Queued {
                    cell.start_processing();
                    batch.push(cell.clone());
                }
                state.cells.insert(cell.id.clone(), cell);
            }
            batch
        };

        tracing::info!("🚀 Phase 1: {} top-level cells", batch.len());
        self.monitor.begin_phase("phase-1");
        let mut aborted = self.process_batch(batch, &token, None).await;
        self.monitor.end_phase();
        self.monitor.log_stats("phase-1");

        if aborted.is_none() && !token.is_cancelled() {
            self.monitor.begin_phase("phase-2");
            aborted = self.drain_phase_two(&token).await;
            self.monitor.end_phase();
            self.monitor.log_stats("phase-2");
        }

        Ok(self.finish(started_at, aborted))
    }

    /// 把失敗的格子重新處理一輪。每個格子最多嘗試 `max_attempts` 次，
    /// 新產生的切分會再經過第二階段。
    pub async fn retry_failed(&self, max_attempts: u32) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let token = self.token().child_token();

        let batch: Vec<Cell> = {
            let mut state = self.state();
            let mut batch = Vec::new();
            for cell in state.cells.values_mut() {
                if cell.status() != CellStatus::Failed {
                    continue;
                }
                // 無法解析的格子再試也一樣
                if cell.center.is_none() {
                    continue;
                }
                cell.start_processing();
                batch.push(cell.clone());
            }
            batch
        };

        if batch.is_empty() {
            tracing::info!("✅ No failed cells to retry");
            return Ok(self.finish(started_at, None));
        }

        let policy =
            RetryPolicy::new(max_attempts, self.settings.retry.base_delay).retry_on_any_error();
        tracing::info!(
            "🔁 Retrying {} failed cells (up to {} attempts each)",
            batch.len(),
            policy.max_attempts
        );

        self.monitor.begin_phase("retry");
        let mut aborted = self.process_batch(batch, &token, Some(policy)).await;
        if aborted.is_none() && !token.is_cancelled() {
            aborted = self.drain_phase_two(&token).await;
        }
        self.monitor.end_phase();

        Ok(self.finish(started_at, aborted))
    }

    pub fn quota_status(&self) -> QuotaStatus {
        self.budget.status()
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        let state = self.state();
        let mut stats = ProcessingStats {
            cells_total: state.cells.len(),
            phase_two_pending: state.phase_two_queue.len(),
            probes_issued: state.probes_issued,
            api_calls: self.api_calls(),
            items_leaked: state.items_leaked,
            validation_failures: state.validation_failures,
            ..Default::default()
        };
        for cell in state.cells.values() {
            match cell.status() {
                CellStatus::Queued => stats.cells_queued += 1,
                CellStatus::Processing => stats.cells_processing += 1,
                CellStatus::Fetched => stats.cells_fetched += 1,
                CellStatus::Split => stats.cells_split += 1,
                CellStatus::Failed => stats.cells_failed += 1,
            }
        }
        stats
    }

    /// 清除所有格子、結果與額度計數，並重設取消狀態
    pub fn clear_history(&self) {
        *self.state() = PipelineState::default();
        self.budget.reset();
        self.calls_baseline
            .store(self.gate.admitted(), Ordering::SeqCst);
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = CancellationToken::new();
        tracing::info!("🧹 Pipeline history cleared");
    }

    /// 要求停止目前這一輪 (沒有執行中時則是下一輪)：進行中的請求會完成，
    /// 尚未開始的格子維持排隊狀態，之後的 `run_pipeline` 會接續處理。
    pub fn cancel(&self) {
        tracing::warn!("⏹️ Cancellation requested");
        self.token().cancel();
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.state().cells.values().cloned().collect()
    }

    pub fn merge_results(&self) -> Vec<MergeResult> {
        self.state().merges.values().cloned().collect()
    }

    /// 已取回的資料，依格子 id 排序；越界資料放在最後
    pub fn harvested_items(&self) -> Vec<HarvestedItem> {
        let state = self.state();
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for cell in state.cells.values() {
            if cell.status() != CellStatus::Fetched {
                continue;
            }
            let Some(outcome) = state.outcomes.get(&cell.id) else {
                continue;
            };
            for item in &outcome.items {
                if seen.insert(item.id.clone()) {
                    items.push(HarvestedItem {
                        cell_id: Some(cell.id.clone()),
                        item: item.clone(),
                    });
                }
            }
        }

        let mut rest: Vec<&ExternalItem> = state
            .run_items
            .values()
            .filter(|item| !seen.contains(&item.id))
            .collect();
        rest.sort_by(|a, b| a.id.cmp(&b.id));
        items.extend(rest.into_iter().map(|item| HarvestedItem {
            cell_id: None,
            item: item.clone(),
        }));
        items
    }

    fn api_calls(&self) -> u64 {
        self.gate
            .admitted()
            .saturating_sub(self.calls_baseline.load(Ordering::SeqCst)) as u64
    }

    fn materialize_top_level(&self, ids: &[String]) -> Vec<Cell> {
        let mut seen = HashSet::new();
        ids.iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty() && seen.insert(raw.to_string()))
            .map(|raw| {
                let id = CellId::new(raw);
                match self.grid.cell_resolution(&id) {
                    Ok(resolution) => {
                        let cell = Cell::top_level(id.clone(), resolution);
                        match (self.grid.cell_to_center(&id), self.grid.cell_to_boundary(&id)) {
                            (Ok(center), Ok(boundary)) => cell.with_geometry(center, boundary),
                            _ => cell,
                        }
                    }
                    Err(e) => {
                        tracing::warn!("❌ Invalid cell id {}: {}", id, e);
                        let mut cell = Cell::top_level(id, 0);
                        cell.mark_failed(e.to_string());
                        cell
                    }
                }
            })
            .collect()
    }

    async fn drain_phase_two(&self, token: &CancellationToken) -> Option<String> {
        let mut round = 0;
        loop {
            let batch: Vec<Cell> = {
                let mut state = self.state();
                let PipelineState {
                    cells,
                    phase_two_queue,
                    ..
                } = &mut *state;
                let mut batch = Vec::with_capacity(phase_two_queue.len());
                while let Some(id) = phase_two_queue.pop_front() {
                    if let Some(cell) = cells.get_mut(&id) {
                        if cell.status() == CellStatus::Queued {
                            cell.start_processing();
                            batch.push(cell.clone());
                        }
                    }
                }
                batch
            };
            if batch.is_empty() || token.is_cancelled() {
                if !batch.is_empty() {
                    self.requeue(batch.iter().map(|c| c.id.clone()));
                }
                return None;
            }

            round += 1;
            tracing::info!("🔁 Phase 2 round {}: {} child cells", round, batch.len());
            if let Some(reason) = self.process_batch(batch, token, None).await {
                return Some(reason);
            }
        }
    }

    fn requeue(&self, ids: impl IntoIterator<Item = CellId>) {
        let mut state = self.state();
        for id in ids {
            let is_child = match state.cells.get_mut(&id) {
                Some(cell) => {
                    cell.requeue();
                    !cell.is_top_level()
                }
                None => continue,
            };
            if is_child {
                state.phase_two_queue.push_back(id);
            }
        }
    }

    /// 以有界併發處理一批格子；回傳中止原因 (每日額度耗盡)
    async fn process_batch(
        &self,
        batch: Vec<Cell>,
        token: &CancellationToken,
        sweep: Option<RetryPolicy>,
    ) -> Option<String> {
        let width = self.settings.concurrency.max(1);
        let mut aborted = None;

        let mut completions = stream::iter(batch)
            .map(|cell| async move {
                let outcome = match sweep {
                    Some(policy) => {
                        let cell_ref = &cell;
                        policy
                            .run(move |_| self.attempt_cell(cell_ref, token))
                            .await
                    }
                    None => self.attempt_cell(&cell, token).await,
                };
                (cell.id, outcome)
            })
            .buffer_unordered(width);

        while let Some((id, outcome)) = completions.next().await {
            match outcome {
                Ok(result) => {
                    let mut state = self.state();
                    self.record_result(&mut state, &id, result);
                }
                Err(HarvestError::Cancelled) => self.requeue([id]),
                Err(err) => {
                    if matches!(err, HarvestError::QuotaExceeded { .. }) && aborted.is_none() {
                        tracing::error!("🛑 Daily quota exhausted while processing {}; aborting run", id);
                        aborted = Some(err.to_string());
                        token.cancel();
                    } else {
                        tracing::warn!("❌ Cell {} failed: {}", id, err);
                    }
                    if let Some(cell) = self.state().cells.get_mut(&id) {
                        cell.mark_failed(err.to_string());
                    }
                }
            }
        }

        aborted
    }

    /// 規劃探針並查詢一個格子。結果沒有任何成功的探針時視為失敗；
    /// 途中被取消則回傳 `Cancelled`，部分結果不保留。
    async fn attempt_cell(&self, cell: &Cell, cancel: &CancellationToken) -> Result<CellResult> {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        let probes = self.planner.plan_validated(cell)?;
        let result = self.search.search_cell(cell, &probes, cancel).await?;
        if result.cancelled {
            return Err(HarvestError::Cancelled);
        }
        if result.status == SearchStatus::Failed {
            return Err(HarvestError::ProcessingError {
                message: result
                    .error
                    .unwrap_or_else(|| "all probes failed".to_string()),
            });
        }
        Ok(result)
    }

    fn record_result(&self, state: &mut PipelineState, id: &CellId, result: CellResult) {
        state.probes_issued += result.per_probe_results.len() as u64;
        state.items_leaked += result.leaked_items.len() as u64;
        state.validation_failures += result.validation_failures as u64;
        for item in result.unique_items.iter().chain(result.leaked_items.iter()) {
            state
                .run_items
                .entry(item.id.clone())
                .or_insert_with(|| item.clone());
        }
        for item in &result.leaked_items {
            state.leaked_ids.insert(item.id.clone());
        }

        let Some(cell) = state.cells.get(id) else {
            return;
        };
        let count = result.total_count;
        let dense = self.subdivision.is_dense(count);
        // 頂層格子一定切分；子格子依設定決定是否遞迴
        let may_split = cell.is_top_level() || self.settings.recursive_split;

        if dense && may_split && self.subdivision.can_split(cell) {
            match self
                .subdivision
                .split(cell, cell.resolution + 1, &mut state.index)
            {
                Ok(children) => {
                    let child_ids: Vec<CellId> = children.iter().map(|c| c.id.clone()).collect();
                    let marked = state
                        .cells
                        .get_mut(id)
                        .is_some_and(|cell| cell.mark_split(count, child_ids));
                    if marked {
                        for child in children {
                            if state.cells.contains_key(&child.id) {
                                continue;
                            }
                            state.phase_two_queue.push_back(child.id.clone());
                            state.cells.insert(child.id.clone(), child);
                        }
                        return;
                    }
                    tracing::warn!("⚠️ Split of {} produced no children; keeping its results", id);
                }
                Err(e) => tracing::warn!("⚠️ Could not split dense cell {}: {}", id, e),
            }
        } else if dense {
            tracing::info!(
                "📦 {} still dense ({} results) at resolution {}; keeping truncated results",
                id,
                count,
                cell.resolution
            );
        }

        let any_truncated = result.per_probe_results.iter().any(|p| p.truncated);
        let label = if dense {
            CoverageLabel::Truncated
        } else if count == 0 {
            CoverageLabel::Empty
        } else if result.status == SearchStatus::Partial {
            CoverageLabel::PartialProbes
        } else if any_truncated {
            CoverageLabel::Truncated
        } else {
            CoverageLabel::Complete
        };

        if let Some(cell) = state.cells.get_mut(id) {
            cell.mark_fetched(count, label);
        }
        state.outcomes.insert(
            id.clone(),
            CellOutcome::new(count, result.unique_items, dense),
        );
    }

    /// 由最細的解析度往上合併已切分的格子
    fn merge_split_cells(&self, state: &mut PipelineState) {
        let mut parents: Vec<(u8, CellId)> = state
            .cells
            .values()
            .filter(|c| c.status() == CellStatus::Split)
            .map(|c| (c.resolution, c.id.clone()))
            .collect();
        parents.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (_, id) in parents {
            let merged = self
                .subdivision
                .merge_children(&id, &state.index, &state.outcomes);
            tracing::debug!(
                "🧩 Merged {}: {} results from {} children ({})",
                id,
                merged.total_count,
                state.index.children_of(&id).len(),
                CoverageLabel::Merged(merged.coverage)
            );
            state.outcomes.insert(
                id.clone(),
                CellOutcome::new(
                    merged.total_count,
                    merged.unique_items.clone(),
                    merged.coverage == MergeCoverage::PartialDense,
                ),
            );
            if let Some(cell) = state.cells.get_mut(&id) {
                cell.coverage = CoverageLabel::Merged(merged.coverage);
            }
            state.merges.insert(id, merged);
        }
    }

    fn finish(&self, started_at: DateTime<Utc>, aborted: Option<String>) -> PipelineReport {
        let report = {
            let mut state = self.state();
            self.merge_split_cells(&mut state);
            self.build_report(&state, started_at, aborted)
        };

        // 取消只作用在這一輪
        if report.cancelled {
            *self
                .cancel
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = CancellationToken::new();
        }

        tracing::info!(
            "🏁 {} cells: {} fetched, {} split, {} failed, {} queued; {} unique items, {} calls, quality {:?}",
            report.total_cells,
            report.fetched,
            report.split,
            report.failed,
            report.queued,
            report.total_unique_items,
            report.api_calls,
            report.quality
        );
        report
    }

    fn build_report(
        &self,
        state: &PipelineState,
        started_at: DateTime<Utc>,
        aborted: Option<String>,
    ) -> PipelineReport {
        let finished_at = Utc::now();
        let mut per_resolution: BTreeMap<u8, ResolutionStats> = BTreeMap::new();
        let mut failed_cells = Vec::new();
        let (mut fetched, mut split, mut failed, mut queued, mut top_level) = (0, 0, 0, 0, 0);

        for cell in state.cells.values() {
            if cell.is_top_level() {
                top_level += 1;
            }
            let stats = per_resolution.entry(cell.resolution).or_default();
            stats.cells += 1;
            match cell.status() {
                CellStatus::Fetched => {
                    fetched += 1;
                    stats.fetched += 1;
                    stats.items += cell.result_count;
                }
                CellStatus::Split => {
                    split += 1;
                    stats.split += 1;
                }
                CellStatus::Failed => {
                    failed += 1;
                    stats.failed += 1;
                    failed_cells.push(FailedCell {
                        id: cell.id.clone(),
                        resolution: cell.resolution,
                        reason: cell.error.clone().unwrap_or_default(),
                    });
                }
                CellStatus::Queued | CellStatus::Processing => {
                    queued += 1;
                    stats.queued += 1;
                }
            }
        }

        let total_cells = state.cells.len();
        // 只以已結束的格子評分；排隊中的格子 (例如取消後) 不算失敗
        let settled = fetched + split + failed;
        let ratio = if settled == 0 {
            1.0
        } else {
            (fetched + split) as f64 / settled as f64
        };

        PipelineReport {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            top_level_cells: top_level,
            total_cells,
            fetched,
            split,
            failed,
            queued,
            per_resolution,
            total_unique_items: state.run_items.len(),
            leaked_items: state.leaked_ids.len(),
            api_calls: self.api_calls(),
            quality: CoverageQuality::from_success_ratio(ratio),
            failed_cells,
            cancelled: self.token().is_cancelled(),
            aborted,
            quota: self.budget.status(),
        }
    }
}
