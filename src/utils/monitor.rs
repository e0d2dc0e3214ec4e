use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(feature = "cli")]
use sysinfo::{Pid, System};

#[derive(Debug, Clone)]
pub struct SystemStats {
    pub cpu_usage: f32,
    pub memory_usage_mb: u64,
    pub peak_memory_mb: u64,
    pub elapsed_time: Duration,
}

/// 記錄每個階段耗時，並在 `cli` 功能開啟時附帶行程的 CPU / 記憶體用量
pub struct PhaseMonitor {
    enabled: bool,
    start_time: Instant,
    phase_started: Mutex<Option<(String, Instant)>>,
    phases: Mutex<Vec<(String, Duration)>>,
    #[cfg(feature = "cli")]
    system: Mutex<System>,
    #[cfg(feature = "cli")]
    pid: Option<Pid>,
    #[cfg(feature = "cli")]
    peak_memory: Mutex<u64>,
}

impl PhaseMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            start_time: Instant::now(),
            phase_started: Mutex::new(None),
            phases: Mutex::new(Vec::new()),
            #[cfg(feature = "cli")]
            system: Mutex::new(System::new()),
            #[cfg(feature = "cli")]
            pid: sysinfo::get_current_pid().ok(),
            #[cfg(feature = "cli")]
            peak_memory: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 開始新的階段；若前一個階段尚未結束會先結束它
    pub fn begin_phase(&self, name: &str) {
        if !self.enabled {
            return;
        }
        self.end_phase();
        if let Ok(mut current) = self.phase_started.lock() {
            *current = Some((name.to_string(), Instant::now()));
        }
        self.log_stats(name);
    }

    pub fn end_phase(&self) {
        if !self.enabled {
            return;
        }
        let finished = self
            .phase_started
            .lock()
            .ok()
            .and_then(|mut current| current.take());
        if let Some((name, started)) = finished {
            let elapsed = started.elapsed();
            tracing::info!("⏱️ {} finished in {:?}", name, elapsed);
            if let Ok(mut phases) = self.phases.lock() {
                phases.push((name, elapsed));
            }
        }
    }

    pub fn phase_durations(&self) -> Vec<(String, Duration)> {
        self.phases
            .lock()
            .map(|phases| phases.clone())
            .unwrap_or_default()
    }

    #[cfg(feature = "cli")]
    pub fn get_stats(&self) -> Option<SystemStats> {
        if !self.enabled {
            return None;
        }
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_all();
        let process = system.process(pid)?;
        let memory_mb = process.memory() / 1024 / 1024;

        let mut peak = self.peak_memory.lock().ok()?;
        if memory_mb > *peak {
            *peak = memory_mb;
        }

        Some(SystemStats {
            cpu_usage: process.cpu_usage(),
            memory_usage_mb: memory_mb,
            peak_memory_mb: *peak,
            elapsed_time: self.start_time.elapsed(),
        })
    }

    #[cfg(not(feature = "cli"))]
    pub fn get_stats(&self) -> Option<SystemStats> {
        if !self.enabled {
            return None;
        }
        Some(SystemStats {
            cpu_usage: 0.0,
            memory_usage_mb: 0,
            peak_memory_mb: 0,
            elapsed_time: self.start_time.elapsed(),
        })
    }

    pub fn log_stats(&self, phase: &str) {
        if let Some(stats) = self.get_stats() {
            tracing::info!(
                "📊 {} - CPU: {:.1}%, Memory: {}MB, Peak: {}MB, Time: {:?}",
                phase,
                stats.cpu_usage,
                stats.memory_usage_mb,
                stats.peak_memory_mb,
                stats.elapsed_time
            );
        }
    }

    pub fn log_final_stats(&self) {
        self.end_phase();
        if let Some(stats) = self.get_stats() {
            tracing::info!(
                "📊 Final Stats - Total Time: {:?}, Peak Memory: {}MB",
                stats.elapsed_time,
                stats.peak_memory_mb
            );
        }
        for (name, elapsed) in self.phase_durations() {
            tracing::info!("📊   {}: {:?}", name, elapsed);
        }
    }
}

impl Default for PhaseMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = PhaseMonitor::new(false);
        monitor.begin_phase("phase-1");
        monitor.end_phase();
        assert!(monitor.phase_durations().is_empty());
        assert!(monitor.get_stats().is_none());
    }

    #[test]
    fn test_phases_are_recorded_in_order() {
        let monitor = PhaseMonitor::new(true);
        monitor.begin_phase("phase-1");
        monitor.begin_phase("phase-2");
        monitor.end_phase();

        let names: Vec<String> = monitor
            .phase_durations()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["phase-1", "phase-2"]);
    }
}
