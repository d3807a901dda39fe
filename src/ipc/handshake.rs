// Connection setup: settings exchange, key agreement and authentication

use crate::ipc::codec::FrameCodec;
use crate::ipc::config::{ClientConfig, ServerConfig};
use crate::ipc::connection::Session;
use crate::ipc::crypto::KeyExchange;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::{Message, MessageType, ResponseStatus, MIMETYPE_BINARY};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Body of the client's CLIENT_CONFIG message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientHello {
    pub encrypt: bool,
}

/// Settings the server announces in reply to CLIENT_CONFIG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSettings {
    pub max_message_size: usize,
    pub compress_cutoff_size: i64,
    pub encrypt: bool,
    pub authenticate: bool,
    pub heartbeat_interval_ms: u64,
}

impl ServerSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            compress_cutoff_size: config.compress_cutoff_size,
            encrypt: config.encrypt,
            authenticate: config.authentication_enabled(),
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
        }
    }

    /// How often the client must send a HEARTBEAT; zero disables them
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Serialize, Deserialize)]
struct Credentials {
    user: String,
    password: String,
}

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| IpcError::Timeout(timeout))?
}

async fn next_message<T>(conn: &mut Framed<T, FrameCodec>) -> Result<Message>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match conn.next().await {
        Some(result) => result,
        None => Err(IpcError::ConnectionClosed),
    }
}

fn expect_type(msg: &Message, expected: MessageType) -> Result<()> {
    if msg.message_type() != expected {
        return Err(IpcError::UnexpectedMessage {
            expected: expected.to_string(),
            actual: msg.message_type().to_string(),
        });
    }
    Ok(())
}

fn expect_ok(response: &Message, request: &Message) -> Result<()> {
    expect_type(response, MessageType::Response)?;
    if response.id() != request.id() {
        return Err(IpcError::HandshakeFailed(format!(
            "response id {} does not match request {}",
            response.id(),
            request.id()
        )));
    }
    if response.response_status() != ResponseStatus::Ok {
        return Err(IpcError::HandshakeFailed(format!(
            "{} rejected: {}",
            request.message_type(),
            response.error_text()
        )));
    }
    Ok(())
}

/// Run the server side of the handshake
///
/// On failure the caller closes the connection; a rejected authentication
/// has already been answered with BAD_REQUEST.
pub async fn accept<T>(conn: &mut Framed<T, FrameCodec>, config: &ServerConfig) -> Result<Session>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(config.handshake_timeout, accept_inner(conn, config)).await
}

async fn accept_inner<T>(conn: &mut Framed<T, FrameCodec>, config: &ServerConfig) -> Result<Session>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::default();

    let hello_msg = next_message(conn).await?;
    expect_type(&hello_msg, MessageType::ClientConfig)?;
    let hello: ClientHello = hello_msg.payload_as()?;
    let settings = ServerSettings::from_config(config);
    conn.send(Message::structured_response(&hello_msg, ResponseStatus::Ok, &settings)?)
        .await?;

    if config.encrypt || hello.encrypt {
        let request = next_message(conn).await?;
        expect_type(&request, MessageType::DiffieHellmanKeyRequest)?;

        let exchange = KeyExchange::new();
        let reply = Message::binary("", MIMETYPE_BINARY, exchange.public_key().to_vec())
            .into_response(request.id(), ResponseStatus::Ok);
        let cipher = exchange.derive(request.payload_binary())?;
        conn.send(reply).await?;
        conn.codec_mut().set_cipher(Arc::new(cipher));
        session.encrypted = true;
        debug!("Session key established");
    }

    if let Some(authenticator) = config.authenticator.as_ref().filter(|a| a.is_active()) {
        let request = next_message(conn).await?;
        expect_type(&request, MessageType::Authentication)?;
        let credentials: Credentials = request.payload_as()?;

        let authenticator = authenticator.clone();
        let Credentials { user, password } = credentials;
        let name = user.clone();
        let role =
            tokio::task::spawn_blocking(move || authenticator.authenticate(&name, &password))
                .await
                .map_err(|e| {
                    IpcError::HandshakeFailed(format!("authentication task failed: {}", e))
                })?;

        match role {
            Some(role) => {
                conn.send(Message::response(&request, ResponseStatus::Ok)).await?;
                debug!("User {} authenticated as {:?}", user, role);
                session.user = Some(user);
                session.role = Some(role);
            }
            None => {
                warn!("Authentication failed for user {}", user);
                conn.send(Message::text_response(
                    &request,
                    ResponseStatus::BadRequest,
                    "Invalid user name or password",
                ))
                .await?;
                return Err(IpcError::AuthenticationFailed(user));
            }
        }
    }

    Ok(session)
}

/// Run the client side of the handshake and return the server's settings
pub async fn connect<T>(
    conn: &mut Framed<T, FrameCodec>,
    config: &ClientConfig,
) -> Result<ServerSettings>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(config.handshake_timeout, connect_inner(conn, config)).await
}

async fn connect_inner<T>(
    conn: &mut Framed<T, FrameCodec>,
    config: &ClientConfig,
) -> Result<ServerSettings>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Message::control_with(
        MessageType::ClientConfig,
        &ClientHello {
            encrypt: config.encrypt,
        },
    )?;
    conn.send(hello.clone()).await?;
    let response = next_message(conn).await?;
    expect_ok(&response, &hello)?;
    let settings: ServerSettings = response.payload_as()?;

    conn.codec_mut().set_max_message_size(settings.max_message_size);
    conn.codec_mut()
        .set_compress_cutoff_size(settings.compress_cutoff_size);

    if config.encrypt || settings.encrypt {
        let exchange = KeyExchange::new();
        let mut request = Message::binary("", MIMETYPE_BINARY, exchange.public_key().to_vec());
        request.message_type = MessageType::DiffieHellmanKeyRequest;
        conn.send(request.clone()).await?;

        let response = next_message(conn).await?;
        expect_ok(&response, &request)?;
        let cipher = exchange.derive(response.payload_binary())?;
        conn.codec_mut().set_cipher(Arc::new(cipher));
        debug!("Session key established");
    }

    if settings.authenticate {
        let (Some(user), Some(password)) = (&config.user_name, &config.password) else {
            return Err(IpcError::AuthenticationFailed(
                "server requires a user name and password".to_string(),
            ));
        };
        let request = Message::control_with(
            MessageType::Authentication,
            &Credentials {
                user: user.clone(),
                password: password.clone(),
            },
        )?;
        conn.send(request.clone()).await?;
        let response = next_message(conn).await?;
        expect_ok(&response, &request)
            .map_err(|_| IpcError::AuthenticationFailed(response.error_text()))?;
    }

    Ok(settings)
}
