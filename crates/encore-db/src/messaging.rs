use std::collections::VecDeque;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use encore_types::models::{ConversationSummary, Message};
use encore_types::{ListingId, MarketError, MarketResult, MessageId, UserId};

use crate::Database;
use crate::identity::require_user;
use crate::inventory::require_listing;
use crate::models::{MessageRow, convert_all, now, parse_id, parse_ts};

const DEFAULT_PAGE_SIZE: u32 = 50;

/// Position inside a thread: everything strictly after this message.
/// Opaque to callers, but serializable so a client can resume later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCursor {
    created_at: String,
    seq: i64,
}

/// One page of a thread plus the cursor to fetch the next one. `next` is
/// `None` once the end of the thread was reached.
#[derive(Debug, Clone)]
pub struct ThreadPage {
    pub messages: Vec<Message>,
    pub next: Option<ThreadCursor>,
}

#[derive(Debug, Clone, Copy)]
struct ThreadKey {
    a: UserId,
    b: UserId,
    listing: Option<ListingId>,
}

impl Database {
    pub fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        text: &str,
        listing_id: Option<ListingId>,
    ) -> MarketResult<Message> {
        if sender_id == receiver_id {
            return Err(MarketError::invalid("cannot send a message to yourself"));
        }
        if text.trim().is_empty() {
            return Err(MarketError::invalid("message cannot be empty"));
        }

        let id = MessageId::new();
        let created_at = self.with_tx(|tx| {
            require_user(tx, sender_id)?;
            require_user(tx, receiver_id)?;
            if let Some(listing_id) = listing_id {
                require_listing(tx, listing_id)?;
            }

            let ts = now();
            tx.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, listing_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    sender_id.to_string(),
                    receiver_id.to_string(),
                    listing_id.map(|l| l.to_string()),
                    text,
                    ts,
                ],
            )?;
            Ok(ts)
        })?;

        debug!(message_id = %id, sender_id = %sender_id, receiver_id = %receiver_id, "Message stored");
        Ok(Message {
            id,
            sender_id,
            receiver_id,
            listing_id,
            text: text.to_string(),
            is_read: false,
            created_at: parse_ts(&created_at)?,
        })
    }

    /// Lazily walk the thread between two users, oldest first. With a
    /// listing, only messages about that listing are included; without one,
    /// the whole conversation is.
    pub fn list_thread(
        &self,
        user_a: UserId,
        user_b: UserId,
        listing_id: Option<ListingId>,
    ) -> ThreadIter<'_> {
        ThreadIter {
            db: self,
            key: ThreadKey {
                a: user_a,
                b: user_b,
                listing: listing_id,
            },
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            fetch_after: None,
            position: None,
            exhausted: false,
        }
    }

    /// Fetch one page of a thread strictly after `after`.
    pub fn thread_page(
        &self,
        user_a: UserId,
        user_b: UserId,
        listing_id: Option<ListingId>,
        after: Option<&ThreadCursor>,
        limit: u32,
    ) -> MarketResult<ThreadPage> {
        let key = ThreadKey {
            a: user_a,
            b: user_b,
            listing: listing_id,
        };
        let limit = limit.max(1);
        let rows = self.with_conn(|conn| query_thread(conn, &key, after, limit))?;

        let next = if rows.len() < limit as usize {
            None
        } else {
            rows.last().map(|(_, cursor)| cursor.clone())
        };
        Ok(ThreadPage {
            messages: rows.into_iter().map(|(m, _)| m).collect(),
            next,
        })
    }

    /// Mark a message read. Only its receiver may; repeating is a no-op.
    pub fn mark_read(&self, message_id: MessageId, reader_id: UserId) -> MarketResult<()> {
        self.with_conn_mut(|conn| {
            let (receiver, is_read): (String, bool) = conn
                .query_row(
                    "SELECT receiver_id, is_read FROM messages WHERE id = ?1",
                    [message_id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| MarketError::not_found("message", message_id))?;

            if parse_id::<UserId>(&receiver)? != reader_id {
                return Err(MarketError::forbidden("only the receiver can mark a message read"));
            }
            if !is_read {
                conn.execute(
                    "UPDATE messages SET is_read = 1 WHERE id = ?1 AND is_read = 0",
                    [message_id.to_string()],
                )?;
            }
            Ok(())
        })
    }

    /// A single message, visible to its sender and receiver only.
    pub fn get_message(&self, message_id: MessageId, viewer_id: UserId) -> MarketResult<Message> {
        let message = self.with_conn(|conn| query_message(conn, message_id))?;
        if message.sender_id != viewer_id && message.receiver_id != viewer_id {
            return Err(MarketError::forbidden("you can only view your own messages"));
        }
        Ok(message)
    }

    pub fn delete_message(&self, message_id: MessageId, actor_id: UserId) -> MarketResult<()> {
        self.with_tx(|tx| {
            let message = query_message(tx, message_id)?;
            if message.sender_id != actor_id && message.receiver_id != actor_id {
                return Err(MarketError::forbidden("you can only delete your own messages"));
            }
            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id.to_string()])?;
            Ok(())
        })?;

        info!(message_id = %message_id, "Message deleted");
        Ok(())
    }

    /// Everything the user sent or received, newest first.
    pub fn inbox(
        &self,
        user_id: UserId,
        unread_only: bool,
        offset: u32,
        limit: u32,
    ) -> MarketResult<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = if unread_only {
                format!(
                    "SELECT {} FROM messages WHERE receiver_id = ?1 AND is_read = 0
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                    MessageRow::COLUMNS
                )
            } else {
                format!(
                    "SELECT {} FROM messages WHERE sender_id = ?1 OR receiver_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                    MessageRow::COLUMNS
                )
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id.to_string(), limit, offset], MessageRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            convert_all(rows)
        })
    }

    pub fn unread_count(&self, user_id: UserId) -> MarketResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id.to_string()],
                |r| r.get(0),
            )?)
        })
    }

    /// One summary per counterpart, most recently active first. Grouping
    /// happens in SQLite; only one row per counterpart comes back.
    pub fn conversations(&self, user_id: UserId) -> MarketResult<Vec<ConversationSummary>> {
        let rows = self.with_conn(|conn| {
            // JOIN the counterpart's username in the same query
            let mut stmt = conn.prepare(
                "WITH mine AS (
                     SELECT rowid AS seq,
                            CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS other,
                            body, created_at,
                            (receiver_id = ?1 AND is_read = 0) AS unread
                     FROM messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                 ),
                 ranked AS (
                     SELECT other, body, created_at, seq,
                            ROW_NUMBER() OVER (
                                PARTITION BY other ORDER BY created_at DESC, seq DESC
                            ) AS rn,
                            SUM(unread) OVER (PARTITION BY other) AS unread_count
                     FROM mine
                 )
                 SELECT r.other, u.username, r.body, r.created_at, r.unread_count
                 FROM ranked r
                 JOIN users u ON u.id = r.other
                 WHERE r.rn = 1
                 ORDER BY r.created_at DESC, r.seq DESC",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(other, username, body, created_at, unread_count)| {
                Ok(ConversationSummary {
                    counterpart_id: parse_id(&other)?,
                    counterpart_username: username,
                    last_message: body,
                    last_message_at: parse_ts(&created_at)?,
                    unread_count,
                })
            })
            .collect()
    }
}

/// Iterator over a thread that fetches one page at a time. Dropping it and
/// calling [`ThreadIter::resume`] with the last [`ThreadIter::cursor`] picks
/// up right after the last message handed out.
pub struct ThreadIter<'a> {
    db: &'a Database,
    key: ThreadKey,
    page_size: u32,
    buffer: VecDeque<(Message, ThreadCursor)>,
    fetch_after: Option<ThreadCursor>,
    position: Option<ThreadCursor>,
    exhausted: bool,
}

impl<'a> ThreadIter<'a> {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Continue after a cursor from an earlier walk of the same thread.
    pub fn resume(mut self, cursor: ThreadCursor) -> Self {
        self.buffer.clear();
        self.fetch_after = Some(cursor.clone());
        self.position = Some(cursor);
        self.exhausted = false;
        self
    }

    /// Position after the last message yielded, if any.
    pub fn cursor(&self) -> Option<&ThreadCursor> {
        self.position.as_ref()
    }

    fn fill(&mut self) -> MarketResult<()> {
        let rows = self.db.with_conn(|conn| {
            query_thread(conn, &self.key, self.fetch_after.as_ref(), self.page_size)
        })?;
        if rows.len() < self.page_size as usize {
            self.exhausted = true;
        }
        if let Some((_, last)) = rows.last() {
            self.fetch_after = Some(last.clone());
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl Iterator for ThreadIter<'_> {
    type Item = MarketResult<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let (message, cursor) = self.buffer.pop_front()?;
        self.position = Some(cursor);
        Some(Ok(message))
    }
}

fn query_thread(
    conn: &Connection,
    key: &ThreadKey,
    after: Option<&ThreadCursor>,
    limit: u32,
) -> MarketResult<Vec<(Message, ThreadCursor)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
           AND (?3 IS NULL OR listing_id = ?3)
           AND (?4 IS NULL OR created_at > ?4 OR (created_at = ?4 AND rowid > ?5))
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?6",
        MessageRow::COLUMNS
    ))?;

    let rows = stmt
        .query_map(
            params![
                key.a.to_string(),
                key.b.to_string(),
                key.listing.map(|l| l.to_string()),
                after.map(|c| c.created_at.as_str()),
                after.map_or(0, |c| c.seq),
                limit,
            ],
            MessageRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            let cursor = ThreadCursor {
                created_at: row.created_at.clone(),
                seq: row.seq,
            };
            Ok((Message::try_from(row)?, cursor))
        })
        .collect()
}

fn query_message(conn: &Connection, id: MessageId) -> MarketResult<Message> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MessageRow::COLUMNS),
            [id.to_string()],
            MessageRow::from_row,
        )
        .optional()?
        .ok_or_else(|| MarketError::not_found("message", id))?;
    row.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{listing, temp_db, user};

    #[test]
    fn send_message_validates_participants_and_text() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");

        assert!(matches!(
            db.send_message(a, a, "hello me", None),
            Err(MarketError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.send_message(a, b, "   ", None),
            Err(MarketError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.send_message(a, UserId::new(), "hi", None),
            Err(MarketError::NotFound { .. })
        ));
        assert!(matches!(
            db.send_message(a, b, "hi", Some(ListingId::new())),
            Err(MarketError::NotFound { entity: "listing", .. })
        ));
    }

    #[test]
    fn thread_is_ordered_and_covers_both_directions() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let c = user(&db, "c");

        db.send_message(a, b, "one", None).unwrap();
        db.send_message(b, a, "two", None).unwrap();
        db.send_message(a, c, "elsewhere", None).unwrap();
        db.send_message(a, b, "three", None).unwrap();

        let texts: Vec<String> = db
            .list_thread(b, a, None)
            .map(|m| m.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn thread_can_be_scoped_to_a_listing() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let l = listing(&db, b, 2);

        db.send_message(a, b, "general", None).unwrap();
        db.send_message(a, b, "about the tickets", Some(l)).unwrap();

        let scoped: Vec<String> = db
            .list_thread(a, b, Some(l))
            .map(|m| m.unwrap().text)
            .collect();
        assert_eq!(scoped, vec!["about the tickets"]);
        assert_eq!(db.list_thread(a, b, None).count(), 2);
    }

    #[test]
    fn thread_pages_lazily_and_resumes_from_cursor() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        for i in 0..7 {
            db.send_message(a, b, &format!("m{}", i), None).unwrap();
        }

        let mut iter = db.list_thread(a, b, None).page_size(3);
        let first: Vec<String> = iter.by_ref().take(4).map(|m| m.unwrap().text).collect();
        assert_eq!(first, vec!["m0", "m1", "m2", "m3"]);
        let cursor = iter.cursor().cloned().unwrap();
        drop(iter);

        let rest: Vec<String> = db
            .list_thread(a, b, None)
            .page_size(3)
            .resume(cursor)
            .map(|m| m.unwrap().text)
            .collect();
        assert_eq!(rest, vec!["m4", "m5", "m6"]);

        // a fresh walk restarts from the beginning
        assert_eq!(db.list_thread(a, b, None).count(), 7);
    }

    #[test]
    fn thread_page_reports_end() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        for i in 0..3 {
            db.send_message(a, b, &format!("m{}", i), None).unwrap();
        }

        let page = db.thread_page(a, b, None, None, 2).unwrap();
        assert_eq!(page.messages.len(), 2);
        let next = page.next.unwrap();
        let last = db.thread_page(a, b, None, Some(&next), 2).unwrap();
        assert_eq!(last.messages.len(), 1);
        assert!(last.next.is_none());
    }

    #[test]
    fn listing_thread_does_not_touch_read_state() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        db.send_message(a, b, "unread", None).unwrap();

        let _ = db.list_thread(a, b, None).count();
        assert_eq!(db.unread_count(b).unwrap(), 1);
    }

    #[test]
    fn mark_read_is_receiver_only_and_idempotent() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let m = db.send_message(a, b, "ping", None).unwrap();

        assert!(matches!(db.mark_read(m.id, a), Err(MarketError::Forbidden(_))));
        db.mark_read(m.id, b).unwrap();
        db.mark_read(m.id, b).unwrap();
        assert!(db.get_message(m.id, b).unwrap().is_read);
        assert_eq!(db.unread_count(b).unwrap(), 0);

        assert!(matches!(
            db.mark_read(MessageId::new(), b),
            Err(MarketError::NotFound { .. })
        ));
    }

    #[test]
    fn only_participants_can_view_or_delete() {
        let db = temp_db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        let eve = user(&db, "eve");
        let m = db.send_message(a, b, "secret", None).unwrap();

        assert!(matches!(db.get_message(m.id, eve), Err(MarketError::Forbidden(_))));
        assert!(matches!(db.delete_message(m.id, eve), Err(MarketError::Forbidden(_))));

        db.delete_message(m.id, b).unwrap();
        assert!(matches!(db.get_message(m.id, a), Err(MarketError::NotFound { .. })));
    }

    #[test]
    fn inbox_and_conversation_summaries() {
        let db = temp_db();
        let me = user(&db, "me");
        let bob = user(&db, "bob");
        let sue = user(&db, "sue");

        db.send_message(bob, me, "from bob 1", None).unwrap();
        db.send_message(bob, me, "from bob 2", None).unwrap();
        db.send_message(me, sue, "to sue", None).unwrap();

        assert_eq!(db.inbox(me, false, 0, 10).unwrap().len(), 3);
        assert_eq!(db.inbox(me, true, 0, 10).unwrap().len(), 2);

        let convos = db.conversations(me).unwrap();
        assert_eq!(convos.len(), 2);
        assert_eq!(convos[0].counterpart_id, sue);
        assert_eq!(convos[0].unread_count, 0);
        assert_eq!(convos[1].counterpart_username, "bob");
        assert_eq!(convos[1].last_message, "from bob 2");
        assert_eq!(convos[1].unread_count, 2);
    }

    #[test]
    fn conversation_summary_tracks_latest_message_either_way() {
        let db = temp_db();
        let me = user(&db, "me");
        let bob = user(&db, "bob");
        let sue = user(&db, "sue");

        let first = db.send_message(bob, me, "tickets still there?", None).unwrap();
        db.send_message(sue, me, "hi from sue", None).unwrap();
        db.send_message(bob, me, "hello??", None).unwrap();
        db.mark_read(first.id, me).unwrap();
        db.send_message(me, bob, "yes, sorry", None).unwrap();

        let convos = db.conversations(me).unwrap();
        assert_eq!(convos.len(), 2);
        assert_eq!(convos[0].counterpart_id, bob);
        assert_eq!(convos[0].last_message, "yes, sorry");
        // only received unread messages count; my own reply does not
        assert_eq!(convos[0].unread_count, 1);
        assert_eq!(convos[1].counterpart_id, sue);
        assert_eq!(convos[1].unread_count, 1);

        assert!(db.conversations(UserId::new()).unwrap().is_empty());
    }
}
