//! Core types for the clawlink gateway client.
//!
//! This crate provides the protocol-level building blocks:
//! - Wire frames (`RequestFrame`, `InboundFrame`) validated at the router boundary
//! - `ChatMessage` / `Role` / content-part text extraction
//! - `Agent` roster with asynchronous identity merging
//! - `ConversationKey` derivation and equivalence
//! - The `ClientError` taxonomy shared by every layer

pub mod agent;
pub mod conversation;
pub mod error;
pub mod frame;
pub mod message;

pub use agent::{Agent, AgentIdentity, AgentListPayload, AgentRoster};
pub use conversation::{ConversationKey, SessionListPayload, SessionSummary};
pub use error::ClientError;
pub use frame::{
    ChatEventPayload, ChatStreamState, EventFrame, InboundFrame, RequestFrame, ResponseFrame,
    StreamFrame,
};
pub use message::{ChatMessage, ContentPart, HistoryPayload, MessageContent, Role};
