use crate::controller::StageRecords;
use crate::monitor::SharedHealth;
use crate::reprocess::ReprocessCoordinator;
use broker::Broker;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub(crate) coordinator: Arc<ReprocessCoordinator>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) records: StageRecords,
    pub(crate) snapshot: SharedHealth,
    pub(crate) prometheus_handle: Option<PrometheusHandle>,
    pub(crate) api_key: Option<String>,
}

impl ApiState {
    pub fn new(
        coordinator: Arc<ReprocessCoordinator>,
        broker: Arc<dyn Broker>,
        records: StageRecords,
        snapshot: SharedHealth,
        prometheus_handle: Option<PrometheusHandle>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            coordinator,
            broker,
            records,
            snapshot,
            prometheus_handle,
            api_key,
        }
    }
}
