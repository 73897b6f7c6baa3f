pub mod clickup;
pub mod gemini;

pub use clickup::{ClickUpClient, DownloadError};
pub use gemini::{GeminiClient, GeminiError};
