// IPC broker module
//
// Request/response messaging, one-way messages, publish/subscribe and
// bounded or circular work queues over TCP or Unix-domain sockets, with
// optional encryption, authentication and write-ahead-log durability.

pub mod error;
pub mod message;
pub mod codec;
pub mod transport;
pub mod crypto;
pub mod auth;
pub mod handshake;
pub mod config;
pub mod queue;
pub mod wal;
pub mod topic;
pub mod broker;
pub mod connection;
pub mod server;
pub mod client;
pub mod bench;
pub mod cli;
pub mod commands;

pub use error::{IpcError, Result};
pub use message::{Message, MessageSize, MessageType, ResponseStatus};
pub use codec::{message_size, FrameCodec};
pub use transport::ConnectionUri;
pub use auth::{Authenticator, Role};
pub use config::{ClientConfig, ServerConfig, ServerOptions};
pub use queue::{QueueKind, QueueStatus};
pub use topic::TopicStatus;
pub use broker::Handler;
pub use server::{Server, ServerStatus};
pub use client::{Client, ResponseFuture, SubscriptionId};
pub use bench::{BenchmarkConfig, BenchmarkMode, BenchmarkResult};
pub use cli::{CourierCli, CourierCommand};
pub use commands::execute_command;
