use encore_db::{ThreadCursor, ThreadPage};
use encore_types::models::{ConversationSummary, Message};
use encore_types::{ListingId, MarketResult, MessageId, UserId};

use crate::Marketplace;

const MAX_PAGE: u32 = 200;

impl Marketplace {
    pub async fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: &str,
        listing_id: Option<ListingId>,
    ) -> MarketResult<Message> {
        let text = text.to_string();
        self.blocking(move |db, _| db.send_message(sender_id, receiver_id, &text, listing_id))
            .await
    }

    /// One page of the thread between two users, oldest first. Pass the
    /// returned `next` cursor to continue; `None` starts from the beginning.
    pub async fn thread(
        &self,
        user_a: UserId,
        user_b: UserId,
        listing_id: Option<ListingId>,
        after: Option<ThreadCursor>,
        limit: u32,
    ) -> MarketResult<ThreadPage> {
        self.blocking(move |db, _| {
            db.thread_page(user_a, user_b, listing_id, after.as_ref(), limit.min(MAX_PAGE))
        })
        .await
    }

    pub async fn mark_read(&self, message_id: MessageId, reader_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, _| db.mark_read(message_id, reader_id))
            .await
    }

    pub async fn message(&self, message_id: MessageId, viewer_id: UserId) -> MarketResult<Message> {
        self.blocking(move |db, _| db.get_message(message_id, viewer_id))
            .await
    }

    pub async fn delete_message(&self, message_id: MessageId, actor_id: UserId) -> MarketResult<()> {
        self.blocking(move |db, _| db.delete_message(message_id, actor_id))
            .await
    }

    pub async fn inbox(
        &self,
        user_id: UserId,
        unread_only: bool,
        offset: u32,
        limit: u32,
    ) -> MarketResult<Vec<Message>> {
        self.blocking(move |db, _| db.inbox(user_id, unread_only, offset, limit.min(MAX_PAGE)))
            .await
    }

    pub async fn unread_count(&self, user_id: UserId) -> MarketResult<i64> {
        self.blocking(move |db, _| db.unread_count(user_id)).await
    }

    pub async fn conversations(&self, user_id: UserId) -> MarketResult<Vec<ConversationSummary>> {
        self.blocking(move |db, _| db.conversations(user_id)).await
    }
}
