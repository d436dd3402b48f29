pub mod anthropic;
pub mod fix;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod recording;

pub use anthropic::AnthropicFixSuggester;
pub use fix::*;
pub use openai::OpenAiFixSuggester;
pub use prompt::{create_user_prompt, get_system_prompt};
pub use provider::{create_fix_suggester, FixProvider, ProviderConfig};
pub use recording::{
    create_http_client, CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger,
    RecordingMiddleware, Sanitizer, ServiceType, CORRELATION_ID_HEADER,
};
