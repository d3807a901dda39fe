//! courier - IPC message broker
//!
//! This library provides a message broker for request/response RPC,
//! one-way messaging, publish/subscribe and durable work queues over TCP
//! or Unix-domain sockets, with optional Diffie-Hellman/AES-256-GCM
//! session encryption and PBKDF2-backed authentication.

pub mod ipc;

pub use ipc::{
    Authenticator, Client, ClientConfig, ConnectionUri, IpcError, Message, MessageType,
    QueueKind, ResponseStatus, Role, Server, ServerConfig,
};
