//! ACP: the JSON-RPC 2.0 line protocol spoken to agents.

pub mod acp;
pub mod message;

pub use acp::{register_memory_tools, AcpConnection, PromptStream, ToolHandler};
pub use message::{
    capabilities, ClientInfo, Incoming, PromptEvent, RpcError, INTERNAL_ERROR, INVALID_REQUEST,
    METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
