use crate::core::pipeline::HarvestedItem;
use crate::domain::model::{Cell, CellStatus, PipelineReport};
use crate::domain::ports::Storage;
use crate::utils::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use zip::write::{FileOptions, ZipWriter};

pub const REPORT_FILE: &str = "harvest_report.json";
pub const ITEMS_FILE: &str = "items.csv";
pub const CELLS_FILE: &str = "cells.csv";
pub const ARCHIVE_FILE: &str = "harvest_output.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
}

/// 把報告、資料與格子狀態寫入 [`Storage`]
pub struct ReportExporter<S: Storage> {
    storage: S,
    formats: Vec<OutputFormat>,
    compress: bool,
}

impl<S: Storage> ReportExporter<S> {
    pub fn new(storage: S, formats: Vec<OutputFormat>, compress: bool) -> Self {
        Self {
            storage,
            formats,
            compress,
        }
    }

    /// 回傳寫出的檔名
    pub async fn export(
        &self,
        report: &PipelineReport,
        cells: &[Cell],
        items: &[HarvestedItem],
    ) -> Result<Vec<String>> {
        let mut files: Vec<(&str, Vec<u8>)> = Vec::new();

        if self.formats.contains(&OutputFormat::Json) {
            files.push((REPORT_FILE, serde_json::to_vec_pretty(report)?));
        }
        if self.formats.contains(&OutputFormat::Csv) {
            files.push((ITEMS_FILE, items_csv(items)?));
            files.push((CELLS_FILE, cells_csv(cells)?));
        }

        if files.is_empty() {
            tracing::warn!("⚠️ No output formats configured, nothing exported");
            return Ok(Vec::new());
        }

        if self.compress {
            tracing::debug!("Creating ZIP file with {} files", files.len());
            let zip_data = {
                let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
                for (name, data) in &files {
                    zip.start_file::<_, ()>(*name, FileOptions::default())?;
                    zip.write_all(data)?;
                }
                let cursor = zip.finish()?;
                cursor.into_inner()
            };
            tracing::debug!("Writing ZIP file ({} bytes) to storage", zip_data.len());
            self.storage.write_file(ARCHIVE_FILE, &zip_data).await?;
            tracing::info!("💾 Exported {} files into {}", files.len(), ARCHIVE_FILE);
            return Ok(vec![ARCHIVE_FILE.to_string()]);
        }

        let mut written = Vec::with_capacity(files.len());
        for (name, data) in files {
            self.storage.write_file(name, &data).await?;
            written.push(name.to_string());
        }
        tracing::info!("💾 Exported {}", written.join(", "));
        Ok(written)
    }
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| HarvestError::ProcessingError {
            message: format!("failed to flush CSV buffer: {}", e),
        })
}

fn items_csv(items: &[HarvestedItem]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["id", "name", "lat", "lng", "cell_id"])?;
    for harvested in items {
        let item = &harvested.item;
        let (lat, lng) = item
            .coordinates
            .map(|p| (p.lat.to_string(), p.lng.to_string()))
            .unwrap_or_default();
        writer.write_record([
            item.id.as_str(),
            item.name.as_deref().unwrap_or(""),
            lat.as_str(),
            lng.as_str(),
            harvested.cell_id.as_ref().map(|c| c.as_str()).unwrap_or(""),
        ])?;
    }
    finish_csv(writer)
}

fn status_label(status: CellStatus) -> &'static str {
    match status {
        CellStatus::Queued => "queued",
        CellStatus::Processing => "processing",
        CellStatus::Fetched => "fetched",
        CellStatus::Failed => "failed",
        CellStatus::Split => "split",
    }
}

fn cells_csv(cells: &[Cell]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "id",
        "resolution",
        "status",
        "parent",
        "result_count",
        "coverage",
        "error",
    ])?;
    for cell in cells {
        writer.write_record([
            cell.id.to_string(),
            cell.resolution.to_string(),
            status_label(cell.status()).to_string(),
            cell.parent_id().map(|p| p.to_string()).unwrap_or_default(),
            cell.result_count.to_string(),
            cell.coverage.to_string(),
            cell.error.clone().unwrap_or_default(),
        ])?;
    }
    finish_csv(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        CellId, CoverageLabel, CoverageQuality, ExternalItem, GeoPoint, QuotaStatus,
    };
    use chrono::Utc;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct MockStorage {
        files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl MockStorage {
        fn new() -> Self {
            Self {
                files: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        async fn get_file(&self, path: &str) -> Option<Vec<u8>> {
            let files = self.files.lock().await;
            files.get(path).cloned()
        }
    }

    impl Storage for MockStorage {
        async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            let files = self.files.lock().await;
            files.get(path).cloned().ok_or_else(|| {
                HarvestError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path),
                ))
            })
        }

        async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
            let mut files = self.files.lock().await;
            files.insert(path.to_string(), data.to_vec());
            Ok(())
        }
    }

    fn report() -> PipelineReport {
        let now = Utc::now();
        PipelineReport {
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            top_level_cells: 1,
            total_cells: 2,
            fetched: 1,
            split: 0,
            failed: 1,
            queued: 0,
            per_resolution: BTreeMap::new(),
            total_unique_items: 2,
            leaked_items: 1,
            api_calls: 3,
            quality: CoverageQuality::Poor,
            failed_cells: Vec::new(),
            cancelled: false,
            aborted: None,
            quota: QuotaStatus {
                daily_used: 3,
                daily_remaining: 97,
                daily_limit: 100,
                per_second_used: 0,
                per_second_remaining: 5,
                per_second_limit: 5,
                last_daily_reset: now,
            },
        }
    }

    fn cells() -> Vec<Cell> {
        let mut fetched = Cell::top_level(CellId::new("a"), 7);
        fetched.mark_fetched(1, CoverageLabel::Complete);
        let mut failed = Cell::child(CellId::new("a/0"), 8, CellId::new("a"));
        failed.mark_failed("boom, with comma");
        vec![fetched, failed]
    }

    fn items() -> Vec<HarvestedItem> {
        let mut named = ExternalItem::new("biz-1", Some(GeoPoint::new(25.03, 121.56)));
        named.name = Some("Tea, House".to_string());
        vec![
            HarvestedItem {
                cell_id: Some(CellId::new("a")),
                item: named,
            },
            HarvestedItem {
                cell_id: None,
                item: ExternalItem::new("biz-2", None),
            },
        ]
    }

    #[tokio::test]
    async fn test_export_plain_files() {
        let storage = MockStorage::new();
        let exporter = ReportExporter::new(
            storage.clone(),
            vec![OutputFormat::Json, OutputFormat::Csv],
            false,
        );

        let written = exporter.export(&report(), &cells(), &items()).await.unwrap();
        assert_eq!(written, vec![REPORT_FILE, ITEMS_FILE, CELLS_FILE]);

        let json: serde_json::Value =
            serde_json::from_slice(&storage.get_file(REPORT_FILE).await.unwrap()).unwrap();
        assert_eq!(json["api_calls"], 3);
        assert_eq!(json["quality"], "poor");

        let items_csv = String::from_utf8(storage.get_file(ITEMS_FILE).await.unwrap()).unwrap();
        let lines: Vec<&str> = items_csv.lines().collect();
        assert_eq!(lines[0], "id,name,lat,lng,cell_id");
        assert_eq!(lines[1], "biz-1,\"Tea, House\",25.03,121.56,a");
        assert_eq!(lines[2], "biz-2,,,,");

        let cells_csv = String::from_utf8(storage.get_file(CELLS_FILE).await.unwrap()).unwrap();
        assert!(cells_csv.contains("a,7,fetched,,1,complete,"));
        assert!(cells_csv.contains("a/0,8,failed,a,0,failed,\"boom, with comma\""));
    }

    #[tokio::test]
    async fn test_export_compressed_archive() {
        let storage = MockStorage::new();
        let exporter = ReportExporter::new(
            storage.clone(),
            vec![OutputFormat::Json, OutputFormat::Csv],
            true,
        );

        let written = exporter.export(&report(), &cells(), &items()).await.unwrap();
        assert_eq!(written, vec![ARCHIVE_FILE]);
        assert!(storage.get_file(REPORT_FILE).await.is_none());

        let data = storage.get_file(ARCHIVE_FILE).await.unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(data)).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec![CELLS_FILE, REPORT_FILE, ITEMS_FILE]);
    }

    #[tokio::test]
    async fn test_export_json_only() {
        let storage = MockStorage::new();
        let exporter = ReportExporter::new(storage.clone(), vec![OutputFormat::Json], false);

        let written = exporter.export(&report(), &cells(), &items()).await.unwrap();
        assert_eq!(written, vec![REPORT_FILE]);
        assert!(storage.get_file(ITEMS_FILE).await.is_none());
    }
}
