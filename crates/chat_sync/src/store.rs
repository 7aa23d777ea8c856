use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MessageRecord, SenderDisplay},
};
use thiserror::Error;

/// A timeline entry. Immutable once confirmed; `is_provisional` is true only
/// between optimistic insertion and server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_provisional: bool,
    pub sender_display: SenderDisplay,
}

impl Message {
    pub fn from_record(record: MessageRecord, sender_display: SenderDisplay) -> Self {
        Self {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            created_at: record.created_at,
            is_provisional: false,
            sender_display,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message was new and is now part of the timeline.
    Inserted,
    /// The message was already present with a confirmed id; nothing changed.
    Duplicate,
    /// The message confirmed an outstanding provisional entry in place.
    ConfirmedProvisional,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreRejection {
    #[error("message id must not be empty")]
    EmptyId,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("message belongs to conversation {actual}, this store tracks {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
}

/// Ordered, deduplicated message timeline for exactly one conversation.
///
/// Every operation is a synchronous, non-yielding transformation, so callers
/// sharing the store behind a mutex can never observe a half-applied merge.
/// Ordering is by `created_at` ascending with insertion order breaking ties.
#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    entries: Vec<Entry>,
    confirmed_ids: HashSet<MessageId>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            confirmed_ids: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Merge one confirmed message coming from the push feed or a poll batch.
    ///
    /// Rule, in order: a confirmed id already present is a duplicate; a record
    /// matching an outstanding provisional entry (same sender, same content)
    /// confirms it in place; anything else is a fresh insert.
    pub fn apply(&mut self, incoming: Message) -> Result<MergeOutcome, StoreRejection> {
        self.validate(&incoming)?;

        if self.confirmed_ids.contains(&incoming.id) {
            return Ok(MergeOutcome::Duplicate);
        }

        if !incoming.is_provisional {
            if let Some(pos) = self.entries.iter().position(|entry| {
                entry.message.is_provisional
                    && entry.message.sender_id == incoming.sender_id
                    && entry.message.content == incoming.content
            }) {
                self.confirmed_ids.insert(incoming.id.clone());
                self.entries[pos].message = incoming;
                self.restore_order(pos);
                return Ok(MergeOutcome::ConfirmedProvisional);
            }
        }

        if !incoming.is_provisional {
            self.confirmed_ids.insert(incoming.id.clone());
        }
        self.insert_sorted(incoming);
        Ok(MergeOutcome::Inserted)
    }

    pub fn apply_batch(
        &mut self,
        batch: Vec<Message>,
    ) -> (BatchReport, Vec<StoreRejection>) {
        let mut report = BatchReport::default();
        let mut rejections = Vec::new();
        for message in batch {
            match self.apply(message) {
                Ok(MergeOutcome::Duplicate) => report.duplicates += 1,
                Ok(_) => report.applied += 1,
                Err(rejection) => {
                    report.rejected += 1;
                    rejections.push(rejection);
                }
            }
        }
        (report, rejections)
    }

    /// Optimistic insertion on behalf of the sender. Returns the generated
    /// provisional id the sender later passes to `confirm` or `withdraw`.
    pub fn insert_provisional(
        &mut self,
        sender_id: UserId,
        content: String,
        created_at: DateTime<Utc>,
        sender_display: SenderDisplay,
    ) -> Result<MessageId, StoreRejection> {
        if content.trim().is_empty() {
            return Err(StoreRejection::EmptyContent);
        }
        let id = MessageId::provisional(created_at);
        self.insert_sorted(Message {
            id: id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id,
            content,
            created_at,
            is_provisional: true,
            sender_display,
        });
        Ok(id)
    }

    /// Replace a provisional entry with its server-confirmed counterpart.
    ///
    /// If the push feed echoed the confirmed record back before the sender's
    /// own call completed, the id is already present: the leftover provisional
    /// entry (if any) is dropped and the result is `Duplicate`.
    pub fn confirm(
        &mut self,
        provisional_id: &MessageId,
        record: MessageRecord,
        sender_display: SenderDisplay,
    ) -> Result<MergeOutcome, StoreRejection> {
        let confirmed = Message::from_record(record, sender_display);
        self.validate(&confirmed)?;

        if self.confirmed_ids.contains(&confirmed.id) {
            self.remove(provisional_id);
            return Ok(MergeOutcome::Duplicate);
        }

        self.confirmed_ids.insert(confirmed.id.clone());
        if let Some(pos) = self.position(provisional_id) {
            self.entries[pos].message = confirmed;
            self.restore_order(pos);
            Ok(MergeOutcome::ConfirmedProvisional)
        } else {
            // Provisional already withdrawn or replaced; keep the confirmed
            // record rather than losing a delivered message.
            self.insert_sorted(confirmed);
            Ok(MergeOutcome::Inserted)
        }
    }

    /// Remove a provisional entry after a failed send. Returns whether an
    /// entry was actually removed.
    pub fn withdraw(&mut self, provisional_id: &MessageId) -> bool {
        self.remove(provisional_id)
    }

    fn validate(&self, message: &Message) -> Result<(), StoreRejection> {
        if message.id.as_str().is_empty() {
            return Err(StoreRejection::EmptyId);
        }
        if message.content.trim().is_empty() {
            return Err(StoreRejection::EmptyContent);
        }
        if message.conversation_id != self.conversation_id {
            return Err(StoreRejection::ConversationMismatch {
                expected: self.conversation_id.clone(),
                actual: message.conversation_id.clone(),
            });
        }
        Ok(())
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.id == *id)
    }

    fn remove(&mut self, id: &MessageId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn insert_sorted(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        // Later arrivals with an equal timestamp sort after existing entries.
        let pos = self
            .entries
            .partition_point(|entry| entry.message.created_at <= message.created_at);
        self.entries.insert(pos, Entry { message, seq });
    }

    /// Re-establish ordering after an in-place replacement. The entry keeps
    /// its original sequence number, so a confirmation whose server timestamp
    /// ties with its neighbors stays where the user already saw it.
    fn restore_order(&mut self, pos: usize) {
        let before_ok = pos == 0 || self.cmp_entries(pos - 1, pos).is_le();
        let after_ok =
            pos + 1 >= self.entries.len() || self.cmp_entries(pos, pos + 1).is_le();
        if before_ok && after_ok {
            return;
        }
        self.entries
            .sort_by(|a, b| (a.message.created_at, a.seq).cmp(&(b.message.created_at, b.seq)));
    }

    fn cmp_entries(&self, a: usize, b: usize) -> std::cmp::Ordering {
        let left = &self.entries[a];
        let right = &self.entries[b];
        (left.message.created_at, left.seq).cmp(&(right.message.created_at, right.seq))
    }
}
