// CLI commands for the courier broker

use crate::ipc::bench::BenchmarkMode;
use crate::ipc::config::ServerOptions;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Default endpoint of the courier server
pub const DEFAULT_URI: &str = "af-inet://127.0.0.1:33333";

/// Courier command-line interface
#[derive(Debug, Parser)]
#[command(name = "courier")]
#[command(version, about = "Message broker for request/response, queues and pub/sub over TCP or Unix sockets")]
pub struct CourierCli {
    #[command(subcommand)]
    pub command: CourierCommand,
}

impl CourierCli {
    /// Directory the server should log into, from flags or the options file
    pub fn log_dir(&self) -> Option<PathBuf> {
        let CourierCommand::Server(args) = &self.command else {
            return None;
        };
        if args.log_dir.is_some() {
            return args.log_dir.clone();
        }
        args.config
            .as_ref()
            .and_then(|path| ServerOptions::load(path).ok())
            .and_then(|options| options.server_log_dir)
    }
}

/// Connection options shared by client commands
#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    /// Server URI (af-inet://host:port, af-unix:///path or a bare port)
    #[arg(short, long, default_value = DEFAULT_URI)]
    pub uri: String,

    /// Request an encrypted session
    #[arg(long)]
    pub encrypt: bool,

    /// User name for servers with authentication
    #[arg(long)]
    pub user: Option<String>,

    /// Password for servers with authentication
    #[arg(long, requires = "user")]
    pub password: Option<String>,
}

/// Options of the `server` command; unset flags fall back to the options file
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_URI)]
    pub uri: String,

    /// JSON options file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Bytes or unit string such as 50MB
    #[arg(long)]
    pub max_message_size: Option<String>,

    #[arg(long)]
    pub max_queues: Option<usize>,

    #[arg(long)]
    pub max_topics: Option<usize>,

    /// Compress payloads above this size (bytes or unit string)
    #[arg(long)]
    pub compress_cutoff_size: Option<String>,

    #[arg(long)]
    pub encrypt: bool,

    /// Write the server log to <dir>/courier-server.log
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Directory for durable queue journals
    #[arg(long)]
    pub wal_dir: Option<PathBuf>,

    #[arg(long)]
    pub wal_compress: bool,

    /// Compact journals before replaying them
    #[arg(long)]
    pub wal_compact: bool,

    /// Saved authenticator file
    #[arg(long)]
    pub authenticator: Option<PathBuf>,

    /// Heartbeat interval in seconds announced to clients
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Queue to create at start: name:capacity[:bounded|circular][:durable]
    #[arg(long = "queue")]
    pub queues: Vec<String>,

    /// Topic to create at start
    #[arg(long = "topic")]
    pub topics: Vec<String>,
}

/// Courier subcommands
#[derive(Debug, Subcommand)]
pub enum CourierCommand {
    /// Run a server with an echo handler
    Server(ServerArgs),

    /// Send a text request and print the response
    Send {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Message text
        text: String,

        #[arg(short, long, default_value = "test")]
        subject: String,

        /// Address a named server function instead of the default handler
        #[arg(short, long)]
        function: Option<String>,

        /// Do not wait for a response
        #[arg(long)]
        oneway: bool,

        /// Response timeout in milliseconds (-1 waits forever)
        #[arg(short, long, default_value = "5000", allow_hyphen_values = true)]
        timeout_ms: i64,
    },

    /// Offer a text message to a queue
    Offer {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Queue name
        queue: String,

        /// Message text
        text: String,

        #[arg(short, long, default_value = "offer")]
        subject: String,

        /// Journal the message if the queue is durable
        #[arg(long)]
        durable: bool,

        /// Wait for capacity in milliseconds (-1 waits forever)
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        timeout_ms: i64,
    },

    /// Poll a message from a queue
    Poll {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Queue name
        queue: String,

        /// Wait for a message in milliseconds (-1 waits forever)
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        timeout_ms: i64,
    },

    /// Publish a text message to a topic
    Publish {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Topic name
        topic: String,

        /// Message text
        text: String,

        #[arg(short, long, default_value = "publish")]
        subject: String,
    },

    /// Subscribe to a topic and print what arrives
    Listen {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Topic name
        topic: String,

        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Show server statistics
    Status {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Add or replace a user in an authenticator file
    AddUser {
        /// Authenticator file (created if missing)
        #[arg(short, long)]
        file: PathBuf,

        user: String,

        password: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },

    /// Run the throughput benchmark
    Bench {
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,

        #[arg(short, long, value_enum, default_value = "client-server")]
        mode: BenchmarkMode,

        /// Payload size in bytes
        #[arg(short = 's', long, default_value = "1024")]
        message_size: usize,

        /// Measured duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Unmeasured warm-up in seconds
        #[arg(long, default_value = "0")]
        ramp_up: u64,

        /// Parallel connections
        #[arg(short, long, default_value = "1")]
        connections: usize,

        #[arg(long)]
        oneway: bool,

        #[arg(long)]
        encrypt: bool,
    },
}
