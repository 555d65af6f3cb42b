//! Discord gateway + REST channel built on serenity.
//!
//! Gateway events are forwarded as `ChannelEvent`s over an mpsc channel; sends
//! go through serenity's HTTP client, which handles rate limits itself.

use super::{Channel, ChannelEvent, IncomingMessage, OutboundMessage, classify_message};
use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use serenity::Client;
use serenity::all::{
    ChannelId, Context, EventHandler, GatewayIntents, GuildId, Message, MessageUpdateEvent, Ready,
    UserId,
};
use serenity::http::Http;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Maximum message length for Discord (we chunk at this).
const MAX_MESSAGE_LEN: usize = 2000;

/// Delay before reconnecting after the gateway client exits with an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Discord bot channel.
pub struct DiscordChannel {
    bot_token: String,
    command_prefix: String,
    http: Arc<Http>,
}

impl DiscordChannel {
    pub fn new(bot_token: String, command_prefix: String) -> Self {
        let http = Arc::new(Http::new(&bot_token));
        Self {
            bot_token,
            command_prefix,
            http,
        }
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }
}

/// Forwards serenity gateway callbacks into our event channel.
struct Forwarder {
    tx: Sender<ChannelEvent>,
    command_prefix: String,
}

impl Forwarder {
    async fn forward(&self, event: ChannelEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("event receiver dropped, discarding gateway event");
        }
    }
}

#[async_trait]
impl EventHandler for Forwarder {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "discord gateway ready");
        self.forward(ChannelEvent::Ready {
            bot_user_id: ready.user.id.get(),
        })
        .await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let incoming = incoming_from_message(&msg);
        self.forward(classify_message(&self.command_prefix, incoming))
            .await;
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old: Option<Message>,
        _new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        // Embed-only updates carry no content or author; nothing to re-match.
        let (Some(author), Some(content)) = (event.author, event.content) else {
            return;
        };
        self.forward(ChannelEvent::MessageEdit(IncomingMessage {
            guild_id: event.guild_id.map(|g| g.get()),
            channel_id: event.channel_id.get(),
            message_id: event.id.get(),
            author_id: author.id.get(),
            author_is_bot: author.bot,
            author_role_ids: Vec::new(),
            text: content,
        }))
        .await;
    }
}

fn incoming_from_message(msg: &Message) -> IncomingMessage {
    IncomingMessage {
        guild_id: msg.guild_id.map(|g| g.get()),
        channel_id: msg.channel_id.get(),
        message_id: msg.id.get(),
        author_id: msg.author.id.get(),
        author_is_bot: msg.author.bot,
        author_role_ids: msg
            .member
            .as_ref()
            .map(|m| m.roles.iter().map(|r| r.get()).collect())
            .unwrap_or_default(),
        text: msg.content.clone(),
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn run(&self, tx: Sender<ChannelEvent>, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let handler = Forwarder {
                tx: tx.clone(),
                command_prefix: self.command_prefix.clone(),
            };
            let mut client = match Client::builder(&self.bot_token, Self::intents())
                .event_handler(handler)
                .await
            {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build discord client");
                    return;
                }
            };
            let shard_manager = client.shard_manager.clone();

            tokio::select! {
                _ = cancel.cancelled() => {
                    shard_manager.shutdown_all().await;
                    break;
                }
                result = client.start() => {
                    match result {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "discord gateway error, reconnecting");
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn send_message(&self, msg: &OutboundMessage) -> Result<()> {
        let channel = ChannelId::new(msg.channel_id);
        for chunk in chunk_message(&msg.text) {
            channel
                .say(&self.http, chunk)
                .await
                .wrap_err_with(|| format!("failed to send message to channel {}", msg.channel_id))?;
        }
        Ok(())
    }

    async fn send_dm(&self, user_id: u64, text: &str) -> Result<()> {
        let dm = UserId::new(user_id)
            .create_dm_channel(&self.http)
            .await
            .wrap_err_with(|| format!("failed to open DM with user {user_id}"))?;
        for chunk in chunk_message(text) {
            dm.say(&self.http, chunk)
                .await
                .wrap_err_with(|| format!("failed to DM user {user_id}"))?;
        }
        Ok(())
    }

    async fn can_read(&self, guild_id: u64, channel_id: u64, user_id: u64) -> Result<bool> {
        let guild_id = GuildId::new(guild_id);
        // Member lookups go through REST, which needs no privileged intent.
        let member = guild_id
            .member(&self.http, UserId::new(user_id))
            .await
            .wrap_err_with(|| format!("failed to fetch member {user_id}"))?;
        let Some(mut channel) = ChannelId::new(channel_id)
            .to_channel(&self.http)
            .await
            .wrap_err_with(|| format!("failed to fetch channel {channel_id}"))?
            .guild()
        else {
            return Ok(false);
        };
        // Threads take their permissions from the parent channel.
        if channel.thread_metadata.is_some()
            && let Some(parent_id) = channel.parent_id
            && let Some(parent) = parent_id
                .to_channel(&self.http)
                .await
                .wrap_err_with(|| format!("failed to fetch channel {parent_id}"))?
                .guild()
        {
            channel = parent;
        }
        let guild = guild_id
            .to_partial_guild(&self.http)
            .await
            .wrap_err_with(|| format!("failed to fetch guild {guild_id}"))?;
        Ok(guild.user_permissions_in(&channel, &member).view_channel())
    }
}

/// Split a message into chunks that fit within Discord's limit.
fn chunk_message(text: &str) -> Vec<&str> {
    if text.chars().count() <= MAX_MESSAGE_LEN {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let limit = byte_index_of_char(remaining, MAX_MESSAGE_LEN);
        if limit >= remaining.len() {
            chunks.push(remaining);
            break;
        }

        // Try to split at a newline within the limit.
        let split_at = match remaining[..limit].rfind('\n') {
            Some(0) | None => limit,
            Some(i) => i,
        };

        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        // Skip the newline we split on.
        remaining = rest.strip_prefix('\n').unwrap_or(rest);
    }

    chunks
}

/// Byte offset of the `n`th char, or the string length if shorter.
fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
