use clap::Parser;
use hexsweep::domain::model::PipelineReport;
use hexsweep::utils::error::{ErrorSeverity, HarvestError};
use hexsweep::utils::monitor::PhaseMonitor;
use hexsweep::utils::{logger, validation::Validate};
use hexsweep::{
    CliArgs, H3Grid, HarvestConfig, HttpSearchApi, LocalStorage, PipelineOrchestrator,
    QuotaBudget, ReportExporter,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // 初始化日誌
    if args.json_logs {
        logger::init_json_logger(args.verbose);
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("🚀 Starting hexsweep");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    // 載入 TOML 配置
    let config = match HarvestConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 驗證配置與命令列參數
    if let Err(e) = config.validate().and_then(|_| args.validate()) {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    let cells = args.collect_cells()?;
    tracing::info!("✅ Configuration loaded and validated successfully");
    display_config_summary(&config, &args, cells.len());

    let monitor_enabled = args.monitor.unwrap_or_else(|| config.monitoring_enabled());
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let api = Arc::new(HttpSearchApi::from_config(&config.api)?);
    let budget = Arc::new(QuotaBudget::new(config.quota_limits()));
    let orchestrator = Arc::new(
        PipelineOrchestrator::new(
            api,
            Arc::new(H3Grid::new()),
            budget,
            config.pipeline_settings(),
        )
        .with_monitor(PhaseMonitor::new(monitor_enabled)),
    );

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No API calls will be made");
        let estimate = orchestrator.estimate(cells.len());
        println!("📊 Quota estimate for {} cells:", cells.len());
        println!("  Estimated calls: {}", estimate.estimated_calls);
        println!("  Daily remaining: {}", estimate.daily_remaining);
        println!("  Usage ratio: {:.1}%", estimate.usage_ratio * 100.0);
        println!("  Risk level: {:?}", estimate.risk_level);
        println!("  Recommendation: {}", estimate.recommendation);
        return Ok(());
    }

    // Ctrl-C 只要求停止，進行中的請求會完成
    let interrupt = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut report = match orchestrator.run_pipeline(&cells).await {
        Ok(report) => report,
        Err(e) => exit_with(e),
    };

    if let Some(attempts) = args.retry_failed {
        if report.failed > 0 && report.aborted.is_none() && !report.cancelled {
            report = match orchestrator.retry_failed(attempts).await {
                Ok(report) => report,
                Err(e) => exit_with(e),
            };
        }
    }

    let storage = LocalStorage::new(config.output_path());
    let exporter = ReportExporter::new(
        storage,
        config.output.output_formats.clone(),
        config.output.compress,
    );
    let written = match exporter
        .export(&report, &orchestrator.cells(), &orchestrator.harvested_items())
        .await
    {
        Ok(written) => written,
        Err(e) => exit_with(e),
    };

    orchestrator.monitor().log_final_stats();
    print_report(&report);
    for file in written {
        println!("📁 Output saved to: {}/{}", config.output_path(), file);
    }

    if let Some(reason) = &report.aborted {
        eprintln!("🛑 Run aborted: {}", reason);
        std::process::exit(3);
    }

    Ok(())
}

fn exit_with(e: HarvestError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ Harvest failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    // 輸出用戶友好的錯誤信息
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = match e.severity() {
        ErrorSeverity::Low => 0,      // 警告，但成功
        ErrorSeverity::Medium => 2,   // 重試錯誤
        ErrorSeverity::High => 1,     // 處理錯誤
        ErrorSeverity::Critical => 3, // 系統或額度錯誤
    };
    std::process::exit(exit_code);
}

fn display_config_summary(config: &HarvestConfig, args: &CliArgs, cell_count: usize) {
    println!("📋 Configuration Summary:");
    println!("  Endpoint: {}", config.api.endpoint);
    println!("  Cells: {}", cell_count);
    println!(
        "  Quota: {}/day, {}/s",
        config.quota.daily_limit, config.quota.per_second_limit
    );
    println!(
        "  Dense threshold: {} (max resolution {}, recursive: {})",
        config.pipeline.dense_threshold,
        config.pipeline.max_resolution,
        config.pipeline.recursive_split
    );
    println!("  Concurrency: {}", config.pipeline.concurrency);
    println!("  Output: {}", config.output_path());

    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }
}

fn print_report(report: &PipelineReport) {
    println!("✅ Harvest finished in {} ms", report.duration_ms);
    println!(
        "  Cells: {} total, {} fetched, {} split, {} failed, {} queued",
        report.total_cells, report.fetched, report.split, report.failed, report.queued
    );
    for (resolution, stats) in &report.per_resolution {
        println!(
            "  res {:>2}: {} cells, {} items",
            resolution, stats.cells, stats.items
        );
    }
    println!(
        "  Unique items: {} ({} found outside their search cell)",
        report.total_unique_items, report.leaked_items
    );
    println!(
        "  API calls: {} (daily remaining {})",
        report.api_calls, report.quota.daily_remaining
    );
    println!("  Coverage quality: {:?}", report.quality);
    for failed in &report.failed_cells {
        println!("  ❌ {} (res {}): {}", failed.id, failed.resolution, failed.reason);
    }
    if report.cancelled {
        println!("  ⏹️ Run was cancelled; remaining cells stay queued");
    }
}
