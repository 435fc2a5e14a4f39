//! Message and channel resolution.
//!
//! Resolves a channel's access hash (cached per client, so per credential)
//! and batch-fetches message descriptors to build the read locations the
//! part readers consume. The batch size is bounded by the backend; input
//! order is preserved in the output.

use crate::crypto::decrypted_size;
use crate::error::{Error, Result};
use crate::metadata::FileMeta;
use crate::reader::{Location, Part};
use crate::telegram::client::StreamClient;
use crate::telegram::MESSAGE_FETCH_BATCH;
use async_trait::async_trait;
use grammers_tl_types as tl;
use std::collections::HashMap;

/// Resolves a file's parts into readable locations.
///
/// Implemented by the worker client; tests substitute a fake backend.
#[async_trait]
pub trait PartFetcher: Send + Sync {
    /// Fetch the message descriptors backing `file` and return its parts in
    /// order, sized for the locator (plaintext sizes for encrypted files).
    async fn file_parts(&self, file: &FileMeta) -> Result<Vec<Part>>;
}

impl StreamClient {
    /// Resolve a channel id to `(channel_id, access_hash)`, cached per client.
    pub async fn resolve_channel(&self, channel_id: i64) -> Result<(i64, i64)> {
        if let Some(access_hash) = self.cached_channel(channel_id) {
            return Ok((channel_id, access_hash));
        }

        let request = tl::functions::channels::GetChannels {
            id: vec![input_channel(channel_id, 0)],
        };
        let chats = match self.invoke(&request).await? {
            tl::enums::messages::Chats::Chats(chats) => chats.chats,
            tl::enums::messages::Chats::Slice(slice) => slice.chats,
        };

        for chat in chats {
            if let tl::enums::Chat::Channel(channel) = chat {
                if channel.id == channel_id {
                    let access_hash = channel.access_hash.unwrap_or_default();
                    self.remember_channel(channel_id, access_hash);
                    return Ok((channel_id, access_hash));
                }
            }
        }

        Err(Error::NotFound(format!("channel {} not accessible", channel_id)))
    }

    /// Fetch the documents for `ids` within a channel, keyed by message id.
    ///
    /// Splits into batches of [`MESSAGE_FETCH_BATCH`]; messages without a
    /// document payload are absent from the result.
    async fn fetch_documents(
        &self,
        channel_id: i64,
        ids: &[i32],
    ) -> Result<HashMap<i32, tl::types::Document>> {
        let (channel_id, access_hash) = self.resolve_channel(channel_id).await?;

        let mut documents = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(MESSAGE_FETCH_BATCH) {
            let request = tl::functions::channels::GetMessages {
                channel: input_channel(channel_id, access_hash),
                id: batch
                    .iter()
                    .map(|&id| tl::enums::InputMessage::Id(tl::types::InputMessageId { id }))
                    .collect(),
            };

            let messages = match self.invoke(&request).await? {
                tl::enums::messages::Messages::Messages(m) => m.messages,
                tl::enums::messages::Messages::Slice(m) => m.messages,
                tl::enums::messages::Messages::ChannelMessages(m) => m.messages,
                tl::enums::messages::Messages::NotModified(_) => Vec::new(),
            };

            for message in messages {
                if let tl::enums::Message::Message(message) = message {
                    if let Some(document) = document_of(&message) {
                        documents.insert(message.id, document);
                    }
                }
            }
        }

        Ok(documents)
    }

    /// Re-resolve one message to obtain a fresh file reference.
    pub(crate) async fn refresh_location(&self, location: &Location) -> Result<Location> {
        let documents = self
            .fetch_documents(location.channel_id, &[location.message_id])
            .await?;
        let document = documents.get(&location.message_id).ok_or_else(|| {
            Error::NotFound(format!(
                "message {} no longer carries a document",
                location.message_id
            ))
        })?;

        Ok(Location {
            channel_id: location.channel_id,
            access_hash: location.access_hash,
            message_id: location.message_id,
            document_id: document.id,
            document_access_hash: document.access_hash,
            file_reference: document.file_reference.clone(),
        })
    }
}

#[async_trait]
impl PartFetcher for StreamClient {
    async fn file_parts(&self, file: &FileMeta) -> Result<Vec<Part>> {
        let ids: Vec<i32> = file.parts.iter().map(|part| part.id).collect();
        let (channel_id, access_hash) = self.resolve_channel(file.channel_id).await?;
        let documents = self.fetch_documents(channel_id, &ids).await?;

        let mut parts = Vec::with_capacity(ids.len());
        for meta in &file.parts {
            let document = documents.get(&meta.id).ok_or_else(|| {
                Error::NotFound(format!("message {} has no document", meta.id))
            })?;

            let size = if file.encrypted {
                decrypted_size(document.size)?
            } else {
                document.size
            };

            parts.push(Part::new(
                Location {
                    channel_id,
                    access_hash,
                    message_id: meta.id,
                    document_id: document.id,
                    document_access_hash: document.access_hash,
                    file_reference: document.file_reference.clone(),
                },
                size,
                meta.salt.clone(),
            ));
        }

        Ok(parts)
    }
}

fn input_channel(channel_id: i64, access_hash: i64) -> tl::enums::InputChannel {
    tl::enums::InputChannel::Channel(tl::types::InputChannel {
        channel_id,
        access_hash,
    })
}

fn document_of(message: &tl::types::Message) -> Option<tl::types::Document> {
    match message.media.as_ref()? {
        tl::enums::MessageMedia::Document(media) => match media.document.as_ref()? {
            tl::enums::Document::Document(document) => Some(document.clone()),
            _ => None,
        },
        _ => None,
    }
}
