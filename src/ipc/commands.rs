// Command handlers for the courier CLI

use crate::ipc::auth::{Authenticator, Role};
use crate::ipc::bench::{self, BenchmarkConfig};
use crate::ipc::cli::{ConnectArgs, CourierCommand, ServerArgs};
use crate::ipc::client::Client;
use crate::ipc::config::{ByteSize, ClientConfig, ServerOptions};
use crate::ipc::message::Message;
use crate::ipc::queue::QueueKind;
use crate::ipc::server::Server;
use crate::ipc::transport::ConnectionUri;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;

/// Execute a courier command
pub async fn execute_command(command: CourierCommand) -> Result<()> {
    match command {
        CourierCommand::Server(args) => handle_server(args).await,
        CourierCommand::Send {
            connect,
            text,
            subject,
            function,
            oneway,
            timeout_ms,
        } => handle_send(connect, text, subject, function, oneway, timeout_ms).await,
        CourierCommand::Offer {
            connect,
            queue,
            text,
            subject,
            durable,
            timeout_ms,
        } => handle_offer(connect, queue, text, subject, durable, timeout_ms).await,
        CourierCommand::Poll {
            connect,
            queue,
            timeout_ms,
        } => handle_poll(connect, queue, timeout_ms).await,
        CourierCommand::Publish {
            connect,
            topic,
            text,
            subject,
        } => handle_publish(connect, topic, text, subject).await,
        CourierCommand::Listen {
            connect,
            topic,
            count,
        } => handle_listen(connect, topic, count).await,
        CourierCommand::Status { connect } => handle_status(connect).await,
        CourierCommand::AddUser {
            file,
            user,
            password,
            admin,
        } => handle_add_user(file, user, password, admin),
        CourierCommand::Bench {
            uri,
            mode,
            message_size,
            duration,
            ramp_up,
            connections,
            oneway,
            encrypt,
        } => {
            let mut config = BenchmarkConfig::new(parse_uri(&uri)?, mode);
            config.message_size = message_size;
            config.duration = Duration::from_secs(duration);
            config.ramp_up = Duration::from_secs(ramp_up);
            config.connections = connections;
            config.oneway = oneway;
            config.encrypt = encrypt;
            let result = bench::run(config).await?;
            println!("{}", result);
            Ok(())
        }
    }
}

fn parse_uri(uri: &str) -> Result<ConnectionUri> {
    uri.parse::<ConnectionUri>()
        .with_context(|| format!("Invalid connection URI: {}", uri))
}

fn timeout_arg(timeout_ms: i64) -> Option<Duration> {
    (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64))
}

async fn connect(args: &ConnectArgs) -> Result<Client> {
    let mut config = ClientConfig::new(parse_uri(&args.uri)?).encrypt(args.encrypt);
    if let Some(user) = &args.user {
        config = config.credentials(user.clone(), args.password.clone().unwrap_or_default());
    }
    Client::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", args.uri))
}

/// Parse `name:capacity[:bounded|circular][:durable]`
pub fn parse_queue_spec(spec: &str) -> Result<(String, usize, QueueKind, bool)> {
    let mut parts = spec.split(':');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .with_context(|| format!("Missing queue name in '{}'", spec))?
        .to_string();
    let capacity = parts
        .next()
        .with_context(|| format!("Missing capacity in '{}'", spec))?
        .parse::<usize>()
        .with_context(|| format!("Invalid capacity in '{}'", spec))?;

    let mut kind = QueueKind::Bounded;
    let mut durable = false;
    for part in parts {
        match part {
            "durable" => durable = true,
            other => kind = other.parse()?,
        }
    }
    Ok((name, capacity, kind, durable))
}

fn server_options(args: &ServerArgs) -> Result<ServerOptions> {
    let mut options = match &args.config {
        Some(path) => ServerOptions::load(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => ServerOptions::default(),
    };

    if args.max_connections.is_some() {
        options.max_connections = args.max_connections;
    }
    if let Some(size) = &args.max_message_size {
        options.max_message_size = Some(ByteSize::Unit(size.clone()));
    }
    if args.max_queues.is_some() {
        options.max_queues = args.max_queues;
    }
    if args.max_topics.is_some() {
        options.max_topics = args.max_topics;
    }
    if let Some(size) = &args.compress_cutoff_size {
        options.compress_cutoff_size = Some(ByteSize::Unit(size.clone()));
    }
    options.encrypt |= args.encrypt;
    if args.log_dir.is_some() {
        options.server_log_dir = args.log_dir.clone();
    }
    if args.wal_dir.is_some() {
        options.write_ahead_log_dir = args.wal_dir.clone();
    }
    options.write_ahead_log_compress |= args.wal_compress;
    options.write_ahead_log_compact |= args.wal_compact;
    if args.authenticator.is_some() {
        options.authenticator = args.authenticator.clone();
    }
    if args.heartbeat_interval.is_some() {
        options.heartbeat_interval = args.heartbeat_interval;
    }
    Ok(options)
}

async fn handle_server(args: ServerArgs) -> Result<()> {
    let config = server_options(&args)?
        .into_config(parse_uri(&args.uri)?)
        .context("Invalid server configuration")?;

    let server = Server::with_handler(config, |msg: Message| -> anyhow::Result<Option<Message>> {
        Ok(Some(msg))
    })
    .await
    .context("Failed to start server")?;

    for spec in &args.queues {
        let (name, capacity, kind, durable) = parse_queue_spec(spec)?;
        if server.exists_queue(&name).await {
            tracing::info!("Queue {} already restored", name);
            continue;
        }
        server
            .create_queue(&name, capacity, kind, durable)
            .await
            .with_context(|| format!("Failed to create queue {}", name))?;
    }
    for topic in &args.topics {
        server
            .create_topic(topic)
            .await
            .with_context(|| format!("Failed to create topic {}", topic))?;
    }

    println!("Courier server listening on {}", server.local_uri());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    server.close().await;
    println!("Server stopped");
    Ok(())
}

fn print_response(response: &Message) {
    let body = if response.is_binary() {
        format!("<{} bytes>", response.payload_binary().len())
    } else {
        response.payload_text().unwrap_or_default()
    };
    println!("{} {}", response.response_status(), body);
}

async fn handle_send(
    args: ConnectArgs,
    text: String,
    subject: String,
    function: Option<String>,
    oneway: bool,
    timeout_ms: i64,
) -> Result<()> {
    let client = connect(&args).await?;
    let msg = Message::plain_text(subject, &text);

    if oneway {
        client.send_oneway(msg)?;
        // Give the writer a moment before the connection drops
        tokio::time::sleep(Duration::from_millis(100)).await;
        println!("Sent");
    } else {
        let timeout = timeout_arg(timeout_ms);
        let response = match function {
            Some(function) => client.send_to(&function, msg, timeout).await?,
            None => client.send(msg, timeout).await?,
        };
        print_response(&response);
    }
    client.close();
    Ok(())
}

async fn handle_offer(
    args: ConnectArgs,
    queue: String,
    text: String,
    subject: String,
    durable: bool,
    timeout_ms: i64,
) -> Result<()> {
    let client = connect(&args).await?;
    let msg = Message::plain_text(subject, &text).with_durable(durable);
    let response = client.offer(&queue, msg, timeout_arg(timeout_ms)).await?;
    print_response(&response);
    client.close();
    Ok(())
}

async fn handle_poll(args: ConnectArgs, queue: String, timeout_ms: i64) -> Result<()> {
    let client = connect(&args).await?;
    let response = client.poll(&queue, timeout_arg(timeout_ms)).await?;
    print_response(&response);
    client.close();
    Ok(())
}

async fn handle_publish(
    args: ConnectArgs,
    topic: String,
    text: String,
    subject: String,
) -> Result<()> {
    let client = connect(&args).await?;
    let response = client
        .publish(&topic, Message::plain_text(subject, &text))
        .await?;
    print_response(&response);
    client.close();
    Ok(())
}

async fn handle_listen(args: ConnectArgs, topic: String, count: Option<usize>) -> Result<()> {
    let client = connect(&args).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    client
        .subscribe(&topic, move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .with_context(|| format!("Failed to subscribe to {}", topic))?;
    println!("Listening on {} (Ctrl+C to stop)", topic);

    let mut received = 0usize;
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let body = msg.payload_text().unwrap_or_else(|_| {
                    format!("<{} bytes>", msg.payload_binary().len())
                });
                println!("[{}] {}", msg.subject(), body);
                received += 1;
                if count.is_some_and(|n| received >= n) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.close();
    Ok(())
}

async fn handle_status(args: ConnectArgs) -> Result<()> {
    let client = connect(&args).await?;
    let status = client.server_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    client.close();
    Ok(())
}

fn handle_add_user(file: std::path::PathBuf, user: String, password: String, admin: bool) -> Result<()> {
    let mut authenticator = if file.exists() {
        Authenticator::load(&file)
            .with_context(|| format!("Failed to load {}", file.display()))?
    } else {
        Authenticator::new()
    };
    let role = if admin { Role::Admin } else { Role::User };
    authenticator.add_credentials(&user, &password, role)?;
    authenticator
        .save(&file)
        .with_context(|| format!("Failed to save {}", file.display()))?;
    println!(
        "Saved {} ({:?}) to {} [{} user(s)]",
        user,
        role,
        file.display(),
        authenticator.user_count()
    );
    Ok(())
}
