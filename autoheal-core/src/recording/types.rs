use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,      // ISO 8601 timestamp
    pub correlation_id: String, // Groups the request/response pair of one exchange
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String,       // e.g. "webhook", "GET /repos/o/r/actions/runs/1"
    pub data: serde_json::Value, // Sanitized request/response data
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    WebhookReceived,
    GitHubApiCall,
    FixProviderCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ServiceType {
    GitHub,
    OpenAi,
    Anthropic,
}

impl ServiceType {
    pub fn event_type(self) -> EventType {
        match self {
            ServiceType::GitHub => EventType::GitHubApiCall,
            ServiceType::OpenAi | ServiceType::Anthropic => EventType::FixProviderCall,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
