pub mod error;
pub mod http;
pub mod llm;
pub mod queue;
pub mod rate_limit;
pub mod session;
pub mod summarizer;
pub mod text;
pub mod transcript;
pub mod video_url;
