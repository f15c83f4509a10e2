pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod prompts;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stream;
pub mod ui;

pub use client::{ClientConfig, NewsClient};
pub use error::{ClientError, ClientResult, StreamError};
pub use protocol::{ChatEvent, ChatMessage, Sender};
pub use state::{ChatState, reduce};
pub use stream::ChatStream;
