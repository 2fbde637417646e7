//! Read models the engine shares with the status surface.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};

use api::{
    ApiConfig, HealthSnapshot, InputStatus, MetricsSnapshot, PipelineMetrics, PipelineStatus,
    StatusProvider, StatusSnapshot,
};
use buffer::BufferStats;
use supervisor::SupervisorProbe;

/// One registered input, as exposed to the status surface.
pub(crate) struct InputInfo {
    pub(crate) name: String,
    pub(crate) probe: Option<SupervisorProbe>,
}

/// One registered pipeline, as exposed to the status surface.
pub(crate) struct PipelineInfo {
    pub(crate) name: String,
    pub(crate) buffered: bool,
    pub(crate) filters: usize,
    pub(crate) sources: Vec<String>,
    pub(crate) stats: Option<Arc<BufferStats>>,
}

/// Shared, read-mostly view of the engine for the status endpoints.
///
/// The engine writes it while configuring and while routing; the status
/// surface only reads snapshots.
#[derive(Default)]
pub struct EngineState {
    running: AtomicBool,
    total_records: AtomicU64,
    wal_enabled: AtomicBool,
    api: RwLock<ApiConfig>,
    inputs: RwLock<Vec<InputInfo>>,
    pipelines: RwLock<Vec<PipelineInfo>>,
}

impl EngineState {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Whether the engine is currently running.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn record_routed(&self) {
        let _ = self.total_records.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of records the routing task has drained so far.
    pub fn total_records(&self) -> u64 {
        self.total_records.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wal_enabled(&self, enabled: bool) {
        self.wal_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn set_api(&self, api: ApiConfig) {
        *self.api.write().expect("api lock poisoned") = api;
    }

    pub(crate) fn add_input(&self, info: InputInfo) {
        self.inputs.write().expect("inputs lock poisoned").push(info);
    }

    pub(crate) fn add_pipeline(&self, info: PipelineInfo) {
        self.pipelines.write().expect("pipelines lock poisoned").push(info);
    }
}

impl StatusProvider for EngineState {
    fn health(&self) -> HealthSnapshot {
        api::health_snapshot(self.running())
    }

    fn metrics(&self) -> MetricsSnapshot {
        let pipelines = self
            .pipelines
            .read()
            .expect("pipelines lock poisoned")
            .iter()
            .map(|p| PipelineMetrics {
                name: p.name.clone(),
                buffer: p.stats.as_ref().map(|s| s.snapshot()),
            })
            .collect();
        MetricsSnapshot {
            total_records: self.total_records(),
            pipelines,
        }
    }

    fn status(&self) -> StatusSnapshot {
        let inputs = self
            .inputs
            .read()
            .expect("inputs lock poisoned")
            .iter()
            .map(|i| InputStatus {
                name: i.name.clone(),
                supervisor: i.probe.as_ref().and_then(|p| p.stats()),
            })
            .collect();
        let pipelines = self
            .pipelines
            .read()
            .expect("pipelines lock poisoned")
            .iter()
            .map(|p| PipelineStatus {
                name: p.name.clone(),
                buffered: p.buffered,
                filters: p.filters,
                sources: p.sources.clone(),
            })
            .collect();
        StatusSnapshot {
            running: self.running(),
            inputs,
            pipelines,
            wal_enabled: self.wal_enabled.load(Ordering::Acquire),
            api: self.api.read().expect("api lock poisoned").clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshots_reflect_state() {
        let state = EngineState::default();
        state.set_running(true);
        state.record_routed();
        state.record_routed();
        state.set_wal_enabled(true);
        state.add_input(InputInfo {
            name: "s1".to_string(),
            probe: None,
        });
        state.add_pipeline(PipelineInfo {
            name: "console".to_string(),
            buffered: false,
            filters: 1,
            sources: vec!["s1".to_string()],
            stats: None,
        });

        assert!(state.health().running);

        let metrics = state.metrics();
        assert_eq!(metrics.total_records, 2);
        assert_eq!(metrics.pipelines.len(), 1);

        let status = state.status();
        assert!(status.wal_enabled);
        assert_eq!(status.inputs[0].name, "s1");
        assert_eq!(status.pipelines[0].sources, vec!["s1".to_string()]);
    }
}
