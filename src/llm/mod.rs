pub mod json;
pub mod openai;
pub mod provider;

pub use openai::OpenAiChatModel;
pub use provider::{sanitize_history, ChatModel, ContentPart, Message, MessageContent};
