use crate::Endpoint;

/// Endpoint change notification emitted by the map synchronizer and consumed
/// by the relay supervisor, the fleet manager and the push channel.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Added(Endpoint),
    Updated(Endpoint),
    Removed(Endpoint),
}

impl EndpointEvent {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            EndpointEvent::Added(e) | EndpointEvent::Updated(e) | EndpointEvent::Removed(e) => e,
        }
    }
}
