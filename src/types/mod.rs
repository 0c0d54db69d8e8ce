pub mod error;
pub mod request;

pub use error::{
    ErrorCategory, ErrorClassifier, LexgateError, ProviderError, Result, ResultExt,
    log_filter_error,
};
pub use request::{CompletionRequest, Message, MessageRole, TokenUsage};
