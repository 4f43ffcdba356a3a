use serde::Serialize;

use maps::{CounterSnapshot, Endpoint};

use crate::NodeRecord;

/// Events published on the operator websocket. The channel is advisory:
/// clients reconcile by re-reading the REST API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    EndpointUpdate(Endpoint),
    NodeStatusUpdate(NodeRecord),
    MetricsUpdate(CounterSnapshot),
}
