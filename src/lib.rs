pub mod actions;
pub mod agent;
pub mod cua;
pub mod events;
pub mod instance;
pub mod messages;

pub use agent::{Agent, AgentConfig, AgentError, FailurePolicy, RunReport, RunStatus, SystemPrompt};
pub use cua::{CuaClient, CuaConfig, ModelProvider};
pub use events::{EventSink, LoopEvent};
pub use instance::{Environment, Instance, InstanceProvider, ScrapybaraClient, ScrapybaraConfig};
pub use messages::{SessionState, ToolCall, Turn};
