//! Text command dispatch: `!pings add|remove|list|test|help`.

use super::Services;
use crate::channel::{IncomingMessage, OutboundMessage};
use crate::pings::ExpressionKind;
use crate::pings::commands::{self, PingsError};

pub const PINGS_HELP: &str = "\
Auto-pings DM you when a message mentions something you watch.

`!pings add [exact|contains] <expr>, <expr>` watch expressions
`!pings remove [exact|contains] <expr>, <expr>` stop watching
`!pings list` show your expressions
`!pings test [exact|contains] <message> | <expr>, <expr>` try a message
`!pings help` show this help

Exact Match needs the whole words in order; Containment matches any part of the text.
Separate expressions with commas or new lines.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingsCommand {
    Add {
        kind: ExpressionKind,
        text: String,
    },
    Remove {
        kind: ExpressionKind,
        text: String,
    },
    List,
    Test {
        kind: ExpressionKind,
        message: String,
        /// Expressions after `|`; the caller's own list when absent.
        expressions: Option<String>,
    },
    Help,
}

impl PingsCommand {
    /// Parse the arguments after `!pings`. `None` for an unknown subcommand.
    pub fn parse(args: &str) -> Option<Self> {
        let (sub, rest) = split_word(args);
        match sub.to_lowercase().as_str() {
            "add" => {
                let (kind, text) = take_kind(rest);
                Some(Self::Add {
                    kind,
                    text: text.to_owned(),
                })
            }
            "remove" | "rm" => {
                let (kind, text) = take_kind(rest);
                Some(Self::Remove {
                    kind,
                    text: text.to_owned(),
                })
            }
            "list" | "ls" => Some(Self::List),
            "test" => {
                let (kind, text) = take_kind(rest);
                let (message, expressions) = match text.rsplit_once('|') {
                    Some((message, expressions)) => {
                        (message.trim(), Some(expressions.trim().to_owned()))
                    }
                    None => (text, None),
                };
                Some(Self::Test {
                    kind,
                    message: message.to_owned(),
                    expressions,
                })
            }
            "" | "help" => Some(Self::Help),
            _ => None,
        }
    }
}

/// Split off the first whitespace-delimited word.
fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

/// Consume a leading mode keyword, defaulting to exact match.
fn take_kind(text: &str) -> (ExpressionKind, &str) {
    let (word, rest) = split_word(text);
    match ExpressionKind::from_keyword(word) {
        Some(kind) => (kind, rest),
        None => (ExpressionKind::default(), text.trim()),
    }
}

/// Handle a prefixed command and reply in the channel it came from.
pub async fn handle_command(services: &Services, message: &IncomingMessage, command: &str, args: &str) {
    if command != "pings" {
        tracing::trace!(command, "ignoring unknown command");
        return;
    }
    let reply = match PingsCommand::parse(args) {
        Some(parsed) => run(services, message, parsed).await,
        None => format!("Unknown pings command.\n\n{PINGS_HELP}"),
    };
    let outbound = OutboundMessage {
        channel_id: message.channel_id,
        text: reply,
    };
    if let Err(e) = services.channel.send_message(&outbound).await {
        tracing::error!(error = ?e, channel_id = message.channel_id, "failed to send command reply");
    }
}

async fn run(services: &Services, message: &IncomingMessage, command: PingsCommand) -> String {
    let user_id = message.author_id.to_string();
    let result = match command {
        PingsCommand::Add { kind, text } => {
            commands::add(
                &services.pings,
                &services.limits,
                &user_id,
                &message.author_role_ids,
                &text,
                kind,
            )
            .await
        }
        PingsCommand::Remove { kind, text } => {
            commands::remove(&services.pings, &user_id, &text, kind).await
        }
        PingsCommand::List => commands::list(&services.pings, &user_id).await,
        PingsCommand::Test {
            kind,
            message: body,
            expressions,
        } => {
            let explicit = expressions.as_deref().map(|e| (e, kind));
            commands::test(&services.pings, &user_id, &body, explicit).await
        }
        PingsCommand::Help => Ok(PINGS_HELP.to_owned()),
    };

    match result {
        Ok(reply) => reply,
        Err(failure @ PingsError::Store(_)) => {
            tracing::error!(error = ?failure, user_id, "pings command failed");
            failure.to_string()
        }
        Err(rejection) => {
            tracing::debug!(user_id, %rejection, "pings command rejected");
            rejection.to_string()
        }
    }
}
