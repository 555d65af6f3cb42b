//! Channel abstraction for the messaging gateway (Discord).

pub mod discord;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// A guild or DM message as seen by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// `None` for direct messages.
    pub guild_id: Option<u64>,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_is_bot: bool,
    /// Guild roles of the author, when known.
    pub author_role_ids: Vec<u64>,
    pub text: String,
}

impl IncomingMessage {
    /// Link that jumps to this message in the Discord client.
    pub fn link(&self) -> Option<String> {
        let guild_id = self.guild_id?;
        Some(format!(
            "https://discord.com/channels/{guild_id}/{}/{}",
            self.channel_id, self.message_id
        ))
    }
}

/// An event received from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The gateway connection is up; outbound sends will now work.
    Ready { bot_user_id: u64 },

    /// A newly posted message.
    Message(IncomingMessage),

    /// An edit of an earlier message, carrying its new content.
    MessageEdit(IncomingMessage),

    /// A prefixed text command (e.g. `!pings add vapor`).
    Command {
        message: IncomingMessage,
        command: String,
        args: String,
    },
}

/// A message to post in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: u64,
    pub text: String,
}

/// Trait for messaging channel integrations.
///
/// Implementations run a background loop that produces `ChannelEvent`s
/// and can send outbound messages. Sends may be slow and may fail; callers
/// log failures and move on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Run the channel's receive loop, sending events to `tx`.
    /// Should run until `cancel` is triggered.
    async fn run(&self, tx: Sender<ChannelEvent>, cancel: CancellationToken);

    /// Post a message in a channel.
    async fn send_message(&self, msg: &OutboundMessage) -> color_eyre::Result<()>;

    /// Send a direct message to a user.
    async fn send_dm(&self, user_id: u64, text: &str) -> color_eyre::Result<()>;

    /// Whether `user_id` is a member of `guild_id` who can view `channel_id`.
    async fn can_read(
        &self,
        guild_id: u64,
        channel_id: u64,
        user_id: u64,
    ) -> color_eyre::Result<bool>;
}

/// Turn a raw message into a `Command` event when it starts with `prefix`,
/// otherwise a plain `Message` event.
pub fn classify_message(prefix: &str, message: IncomingMessage) -> ChannelEvent {
    let Some(rest) = message.text.trim().strip_prefix(prefix) else {
        return ChannelEvent::Message(message);
    };
    // Split command from args: "!pings add x" -> ("pings", "add x")
    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args.trim()),
        None => (rest, ""),
    };
    if prefix.is_empty() || command.is_empty() {
        return ChannelEvent::Message(message);
    }
    let command = command.to_lowercase();
    let args = args.to_owned();
    ChannelEvent::Command {
        message,
        command,
        args,
    }
}
