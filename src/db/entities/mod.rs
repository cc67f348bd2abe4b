pub mod account;
pub mod agent_action;
pub mod draft;
pub mod message_embedding;
pub mod outbound_message;
