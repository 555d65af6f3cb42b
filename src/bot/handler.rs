//! Ping notification pass for new and edited messages.

use super::Services;
use crate::caches;
use crate::channel::IncomingMessage;
use crate::pings::{Expression, exclude_author, find_triggered_expressions};
use std::collections::HashSet;

/// Match `message` against the watch-set and DM every subscriber it triggers.
///
/// Runs for edits too: a subscriber is only notified for expressions not
/// already notified for the same message. Subscribers who cannot view the
/// message's channel are skipped. Each DM failure is logged and the
/// remaining subscribers are still notified.
pub async fn notify_pings(services: &Services, message: &IncomingMessage) {
    if message.author_is_bot || message.text.trim().is_empty() {
        return;
    }
    let (Some(guild_id), Some(link)) = (message.guild_id, message.link()) else {
        return;
    };

    let watch_set = match services.pings.get_all().await {
        Ok(watch_set) => watch_set,
        Err(e) => {
            tracing::error!(error = ?e, message_id = message.message_id, "failed to fetch pings");
            return;
        }
    };

    let triggered = exclude_author(
        find_triggered_expressions(&message.text, &watch_set),
        &message.author_id.to_string(),
    );
    if triggered.is_empty() {
        return;
    }
    let fresh = caches::lock(&services.notified).record_new(message.message_id, triggered);

    let mut recipients: Vec<_> = fresh.into_iter().collect();
    recipients.sort_by(|a, b| a.0.cmp(&b.0));
    for (subscriber, expressions) in recipients {
        let Ok(user_id) = subscriber.parse::<u64>() else {
            tracing::warn!(subscriber, "skipping subscriber with a non-numeric id");
            continue;
        };
        match services
            .channel
            .can_read(guild_id, message.channel_id, user_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    user_id,
                    channel_id = message.channel_id,
                    "subscriber cannot read the channel"
                );
                continue;
            }
            Err(e) => {
                tracing::warn!(error = ?e, user_id, "failed to check channel access, not pinging");
                continue;
            }
        }
        let text = render_notification(&expressions, &link);
        match services.channel.send_dm(user_id, &text).await {
            Ok(()) => tracing::debug!(user_id, count = expressions.len(), "sent ping"),
            Err(e) => tracing::error!(error = ?e, user_id, "failed to send ping"),
        }
    }
}

/// DM body listing the triggering expressions, sorted.
pub fn render_notification(expressions: &HashSet<Expression>, link: &str) -> String {
    let mut names: Vec<&str> = expressions.iter().map(Expression::inner).collect();
    names.sort_unstable();
    let quoted: Vec<String> = names.iter().map(|n| format!("`{n}`")).collect();
    format!(
        "There is a new message that might be of interest to you.\n\
         Triggered by: {}\n\
         Message: {link}",
        quoted.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::caches::notified::NotifiedCache;
    use crate::channel::MockChannel;
    use crate::pings::commands::PingLimits;
    use crate::pings::PingsStore;
    use std::sync::{Arc, Mutex};

    fn message(author_id: u64, text: &str) -> IncomingMessage {
        IncomingMessage {
            guild_id: Some(1),
            channel_id: 2,
            message_id: 3,
            author_id,
            author_is_bot: false,
            author_role_ids: vec![],
            text: text.into(),
        }
    }

    fn readable_by_all(mut channel: MockChannel) -> MockChannel {
        channel.expect_can_read().returning(|_, _, _| Ok(true));
        channel
    }

    async fn services(channel: MockChannel) -> Services {
        let pings = PingsStore::new(Arc::new(MemoryBlobStore::new()));
        pings
            .insert(
                &[
                    Expression::ExactMatch("mongodb driver".into()),
                    Expression::Contains("godb dr".into()),
                ],
                "100",
                10,
            )
            .await
            .unwrap()
            .unwrap();
        pings
            .insert(&[Expression::ExactMatch("vapor".into())], "200", 10)
            .await
            .unwrap()
            .unwrap();
        Services {
            channel: Arc::new(channel),
            pings,
            limits: PingLimits::default(),
            notified: Arc::new(Mutex::new(NotifiedCache::new(10))),
            command_prefix: "!".into(),
        }
    }

    #[test]
    fn notification_lists_sorted_expressions_and_link() {
        let expressions = HashSet::from([
            Expression::Contains("godb dr".into()),
            Expression::ExactMatch("driver".into()),
        ]);
        assert_eq!(
            render_notification(&expressions, "https://discord.com/channels/1/2/3"),
            "There is a new message that might be of interest to you.\n\
             Triggered by: `driver`, `godb dr`\n\
             Message: https://discord.com/channels/1/2/3"
        );
    }

    #[tokio::test]
    async fn dms_each_triggered_subscriber_once() {
        let mut channel = MockChannel::new();
        channel
            .expect_send_dm()
            .withf(|user, text| {
                *user == 100
                    && text.contains("Triggered by: `godb dr`, `mongodb driver`")
                    && text.ends_with("https://discord.com/channels/1/2/3")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let services = services(readable_by_all(channel)).await;

        notify_pings(&services, &message(300, "The MongoDB driver, for Swift?")).await;
    }

    #[tokio::test]
    async fn author_is_never_notified_about_own_message() {
        let mut channel = MockChannel::new();
        channel.expect_send_dm().times(0);
        let services = services(readable_by_all(channel)).await;
        notify_pings(&services, &message(200, "I love vapor")).await;
    }

    #[tokio::test]
    async fn bots_empty_and_direct_messages_are_skipped() {
        let mut channel = MockChannel::new();
        channel.expect_send_dm().times(0);
        let services = services(readable_by_all(channel)).await;

        let mut from_bot = message(300, "vapor");
        from_bot.author_is_bot = true;
        notify_pings(&services, &from_bot).await;

        notify_pings(&services, &message(300, "   ")).await;

        let mut direct = message(300, "vapor");
        direct.guild_id = None;
        notify_pings(&services, &direct).await;
    }

    #[tokio::test]
    async fn edits_only_notify_new_pairs() {
        let mut channel = MockChannel::new();
        channel
            .expect_send_dm()
            .withf(|user, text| *user == 200 && text.contains("`vapor`"))
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_send_dm()
            .withf(|user, text| {
                *user == 100 && text.contains("Triggered by: `godb dr`, `mongodb driver`")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let services = services(readable_by_all(channel)).await;

        notify_pings(&services, &message(300, "vapor")).await;
        // The edit adds a match for 100; 200 was already notified.
        notify_pings(&services, &message(300, "vapor and the mongodb driver")).await;
        // Re-saving the same content notifies nobody.
        notify_pings(&services, &message(300, "vapor and the mongodb driver")).await;
    }

    #[tokio::test]
    async fn failed_dm_does_not_stop_the_others() {
        let mut channel = MockChannel::new();
        channel
            .expect_send_dm()
            .withf(|user, _| *user == 100)
            .times(1)
            .returning(|_, _| Err(color_eyre::eyre::eyre!("cannot send messages to this user")));
        channel
            .expect_send_dm()
            .withf(|user, _| *user == 200)
            .times(1)
            .returning(|_, _| Ok(()));
        let services = services(readable_by_all(channel)).await;

        notify_pings(&services, &message(300, "vapor with the mongodb driver")).await;
    }

    #[tokio::test]
    async fn contains_pings_ignore_token_boundaries() {
        let mut channel = MockChannel::new();
        channel
            .expect_send_dm()
            .withf(|user, text| *user == 100 && text.contains("Triggered by: `godb dr`\n"))
            .times(1)
            .returning(|_, _| Ok(()));
        let services = services(readable_by_all(channel)).await;
        notify_pings(&services, &message(300, "Is there a mongodb driverless mode?")).await;
    }

    #[tokio::test]
    async fn subscribers_without_read_access_are_not_pinged() {
        let mut channel = MockChannel::new();
        channel
            .expect_can_read()
            .withf(|guild, channel, user| *guild == 1 && *channel == 2 && *user == 200)
            .returning(|_, _, _| Ok(false));
        channel
            .expect_can_read()
            .withf(|_, _, user| *user == 100)
            .returning(|_, _, _| Err(color_eyre::eyre::eyre!("unknown member")));
        channel.expect_send_dm().times(0);
        let services = services(channel).await;

        notify_pings(&services, &message(300, "vapor with the mongodb driver")).await;
    }

    #[tokio::test]
    async fn access_is_checked_per_subscriber() {
        let mut channel = MockChannel::new();
        channel
            .expect_can_read()
            .withf(|_, _, user| *user == 100)
            .returning(|_, _, _| Ok(false));
        channel
            .expect_can_read()
            .withf(|_, _, user| *user == 200)
            .returning(|_, _, _| Ok(true));
        channel
            .expect_send_dm()
            .withf(|user, _| *user == 200)
            .times(1)
            .returning(|_, _| Ok(()));
        let services = services(channel).await;

        notify_pings(&services, &message(300, "vapor with the mongodb driver")).await;
    }
}
