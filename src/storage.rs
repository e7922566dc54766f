//! Message storage collaborator.
//!
//! Sessions hand every finished message to a [`MessageStore`]; the trait also
//! carries the read/unread and search operations a viewer needs. The bundled
//! [`MemoryStore`] keeps everything in memory, which is all a development
//! server needs. Implementations serialize their own writes, so the trait is
//! safe to share across sessions.

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Local};

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    /// Envelope recipients, comma-space-joined.
    pub recipients: String,
    pub subject: String,
    pub body: String,
    /// The reconstructed, dot-unstuffed transcript.
    pub raw_data: Vec<u8>,
    pub size: usize,
    pub client_ip: String,
    pub is_read: bool,
    pub created_at: DateTime<Local>,
}

impl Message {
    pub fn new(
        sender: String,
        recipients: String,
        subject: String,
        body: String,
        raw_data: Vec<u8>,
        client_ip: String,
    ) -> Self {
        let size = raw_data.len();
        Self {
            id: 0,
            sender,
            recipients,
            subject,
            body,
            raw_data,
            size,
            client_ip,
            is_read: false,
            created_at: Local::now(),
        }
    }
}

pub trait MessageStore: Send + Sync {
    /// Persists the message, assigning and returning its id.
    fn save(&self, msg: &mut Message) -> Result<i64>;
    /// All messages, newest first.
    fn list(&self) -> Result<Vec<Message>>;
    fn get(&self, id: i64) -> Result<Option<Message>>;
    fn mark_read(&self, id: i64) -> Result<()>;
    fn delete(&self, id: i64) -> Result<()>;
    fn delete_all(&self) -> Result<()>;
    fn unread_count(&self) -> Result<usize>;
    /// Case-insensitive substring match over sender, recipients, subject and
    /// body, newest first.
    fn search(&self, term: &str) -> Result<Vec<Message>>;
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    messages: Vec<Message>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageStore for MemoryStore {
    fn save(&self, msg: &mut Message) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_id += 1;
        msg.id = inner.next_id;
        inner.messages.push(msg.clone());
        Ok(msg.id)
    }

    fn list(&self) -> Result<Vec<Message>> {
        let inner = self.lock();
        Ok(inner.messages.iter().rev().cloned().collect())
    }

    fn get(&self, id: i64) -> Result<Option<Message>> {
        let inner = self.lock();
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    fn mark_read(&self, id: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(msg) = inner.messages.iter_mut().find(|m| m.id == id) {
            msg.is_read = true;
        }
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<()> {
        let mut inner = self.lock();
        inner.messages.retain(|m| m.id != id);
        Ok(())
    }

    fn delete_all(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.messages.clear();
        Ok(())
    }

    fn unread_count(&self) -> Result<usize> {
        let inner = self.lock();
        Ok(inner.messages.iter().filter(|m| !m.is_read).count())
    }

    fn search(&self, term: &str) -> Result<Vec<Message>> {
        let term = term.to_lowercase();
        let matches = |m: &Message| {
            m.sender.to_lowercase().contains(&term)
                || m.recipients.to_lowercase().contains(&term)
                || m.subject.to_lowercase().contains(&term)
                || m.body.to_lowercase().contains(&term)
        };

        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .rev()
            .filter(|m| matches(m))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(sender: &str, subject: &str, body: &str) -> Message {
        Message::new(
            sender.to_string(),
            "rcpt@example.com".to_string(),
            subject.to_string(),
            body.to_string(),
            body.as_bytes().to_vec(),
            "127.0.0.1".to_string(),
        )
    }

    #[test]
    fn save_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let mut a = sample("a@x", "one", "body");
        let mut b = sample("b@x", "two", "body");

        let id_a = store.save(&mut a).unwrap();
        let id_b = store.save(&mut b).unwrap();
        assert_eq!(id_a, 1);
        assert_eq!(id_b, 2);
        assert_eq!(a.id, 1);
    }

    #[test]
    fn list_is_newest_first() {
        let store = MemoryStore::new();
        store.save(&mut sample("a@x", "first", "b")).unwrap();
        store.save(&mut sample("b@x", "second", "b")).unwrap();

        let messages = store.list().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].subject, "second");
        assert_eq!(messages[1].subject, "first");
    }

    #[test]
    fn get_and_delete() {
        let store = MemoryStore::new();
        let mut msg = sample("a@x", "hi", "b");
        let id = store.save(&mut msg).unwrap();

        assert!(store.get(id).unwrap().is_some());
        store.delete(id).unwrap();
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn mark_read_updates_unread_count() {
        let store = MemoryStore::new();
        let mut msg = sample("a@x", "hi", "b");
        let id = store.save(&mut msg).unwrap();
        store.save(&mut sample("b@x", "yo", "b")).unwrap();

        assert_eq!(store.unread_count().unwrap(), 2);
        store.mark_read(id).unwrap();
        assert_eq!(store.unread_count().unwrap(), 1);
        assert!(store.get(id).unwrap().unwrap().is_read);
    }

    #[test]
    fn search_is_case_insensitive_across_fields() {
        let store = MemoryStore::new();
        store
            .save(&mut sample("alice@example.com", "Weekly Report", "numbers"))
            .unwrap();
        store
            .save(&mut sample("bob@example.com", "lunch", "see you at NOON"))
            .unwrap();

        assert_eq!(store.search("REPORT").unwrap().len(), 1);
        assert_eq!(store.search("noon").unwrap().len(), 1);
        assert_eq!(store.search("example.com").unwrap().len(), 2);
        assert!(store.search("nothing").unwrap().is_empty());
    }

    #[test]
    fn delete_all_empties_the_store() {
        let store = MemoryStore::new();
        store.save(&mut sample("a@x", "hi", "b")).unwrap();
        store.delete_all().unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
