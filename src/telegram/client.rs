//! Long-lived authenticated Telegram client.
//!
//! One [`StreamClient`] is pinned to one credential (bot token or user
//! session) and is shared by every read that its worker serves. Transport
//! loss is handled here with a backoff-supervised reconnect; RPC errors are
//! mapped onto the crate's error kinds so the retry policy can live in the
//! readers.

use crate::error::{Error, Result};
use crate::reader::{ChunkSource, Location};
use crate::telegram::backoff::RetrySchedule;
use crate::telegram::session;
use async_trait::async_trait;
use bytes::Bytes;
use grammers_client::{Client, Config as ClientConfig, InitParams, InvocationError};
use grammers_session::Session;
use grammers_tl_types as tl;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Delay before the first reconnect attempt.
const RECONNECT_FIRST_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for reconnect delays.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Reconnect attempts before the failure surfaces.
const RECONNECT_ATTEMPTS: u32 = 6;

/// Credential a client is pinned to.
#[derive(Clone)]
enum Credential {
    Bot(String),
    User(String),
}

/// Authenticated client with its own reconnect loop.
pub struct StreamClient {
    tg: RwLock<Client>,
    credential: Credential,
    api_id: i32,
    api_hash: String,
    /// Resolved channel access hashes for this credential
    channels: Mutex<HashMap<i64, i64>>,
}

impl StreamClient {
    /// Connect and sign in with a bot token.
    pub async fn connect_bot(api_id: i32, api_hash: &str, token: &str) -> Result<Self> {
        let credential = Credential::Bot(token.to_string());
        let tg = connect(api_id, api_hash, &credential).await?;
        debug!("bot worker connected");
        Ok(StreamClient {
            tg: RwLock::new(tg),
            credential,
            api_id,
            api_hash: api_hash.to_string(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Connect with an exported user session string.
    pub async fn connect_user(api_id: i32, api_hash: &str, session_string: &str) -> Result<Self> {
        let credential = Credential::User(session_string.to_string());
        let tg = connect(api_id, api_hash, &credential).await?;
        debug!("user worker connected");
        Ok(StreamClient {
            tg: RwLock::new(tg),
            credential,
            api_id,
            api_hash: api_hash.to_string(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Invoke a raw TL request, reconnecting once on transport loss.
    pub(crate) async fn invoke<R>(&self, request: &R) -> Result<R::Return>
    where
        R: tl::RemoteCall,
        R::Return: Send,
    {
        let client = self.tg.read().await.clone();
        match client.invoke(request).await {
            Ok(response) => Ok(response),
            // RPC errors never warrant a reconnect
            Err(err @ InvocationError::Rpc(_)) => Err(map_invocation(err)),
            Err(err) => {
                warn!("invocation failed, reconnecting: {}", err);
                self.reconnect().await?;
                let client = self.tg.read().await.clone();
                client.invoke(request).await.map_err(map_invocation)
            }
        }
    }

    /// Cached channel access hash, if this client resolved it before.
    pub(crate) fn cached_channel(&self, channel_id: i64) -> Option<i64> {
        self.channels.lock().get(&channel_id).copied()
    }

    /// Remember a resolved channel access hash.
    pub(crate) fn remember_channel(&self, channel_id: i64, access_hash: i64) {
        self.channels.lock().insert(channel_id, access_hash);
    }

    /// Rebuild the underlying connection with exponential backoff.
    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.tg.write().await;
        let mut retries =
            RetrySchedule::new(RECONNECT_FIRST_DELAY, RECONNECT_MAX_DELAY, RECONNECT_ATTEMPTS);
        loop {
            match connect(self.api_id, &self.api_hash, &self.credential).await {
                Ok(client) => {
                    *guard = client;
                    return Ok(());
                }
                Err(err) => match retries.next_delay() {
                    Some(delay) => {
                        warn!("reconnect failed, retrying in {:?}: {}", delay, err);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

async fn connect(api_id: i32, api_hash: &str, credential: &Credential) -> Result<Client> {
    let session = match credential {
        Credential::Bot(_) => Session::new(),
        Credential::User(session_string) => {
            let parsed = session::decode(session_string)?;
            let session = Session::new();
            session.insert_dc(parsed.dc_id, &parsed.addr, &parsed.auth_key);
            session.set_user(0, parsed.dc_id, false);
            session
        }
    };

    let client = Client::connect(ClientConfig {
        session,
        api_id,
        api_hash: api_hash.to_string(),
        params: InitParams {
            // Flood waits are handled by the readers, not slept through here
            flood_sleep_threshold: 0,
            ..Default::default()
        },
    })
    .await
    .map_err(|e| Error::Transport(format!("connect failed: {}", e)))?;

    if let Credential::Bot(token) = credential {
        let authorized = client.is_authorized().await.map_err(map_invocation)?;
        if !authorized {
            client
                .bot_sign_in(token)
                .await
                .map_err(|e| Error::Telegram(format!("bot sign-in failed: {}", e)))?;
        }
    }

    Ok(client)
}

/// Map a grammers invocation error onto the crate's error kinds.
fn map_invocation(err: InvocationError) -> Error {
    match err {
        InvocationError::Rpc(rpc) => {
            if rpc.name.starts_with("FLOOD_WAIT") || rpc.name.starts_with("FLOOD_PREMIUM_WAIT") {
                Error::FloodWait(rpc.value.unwrap_or(1))
            } else if rpc.name.starts_with("FILE_REFERENCE") {
                Error::FileReferenceExpired
            } else if rpc.code == -503 {
                Error::Transport(format!("rpc timeout: {}", rpc))
            } else {
                Error::Telegram(rpc.to_string())
            }
        }
        other => Error::Transport(other.to_string()),
    }
}

/// TL input location for a part's document.
fn input_location(location: &Location) -> tl::enums::InputFileLocation {
    tl::enums::InputFileLocation::InputDocumentFileLocation(tl::types::InputDocumentFileLocation {
        id: location.document_id,
        access_hash: location.document_access_hash,
        file_reference: location.file_reference.clone(),
        thumb_size: String::new(),
    })
}

#[async_trait]
impl ChunkSource for StreamClient {
    async fn chunk(&self, location: &Location, offset: i64, limit: i32) -> Result<Bytes> {
        let request = tl::functions::upload::GetFile {
            precise: false,
            cdn_supported: false,
            location: input_location(location),
            offset,
            limit,
        };

        match self.invoke(&request).await? {
            tl::enums::upload::File::File(file) => Ok(Bytes::from(file.bytes)),
            tl::enums::upload::File::CdnRedirect(_) => {
                Err(Error::Telegram("cdn redirect not supported".to_string()))
            }
        }
    }

    async fn refresh(&self, location: &Location) -> Result<Location> {
        self.refresh_location(location).await
    }
}
