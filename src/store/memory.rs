//! In-memory message and subscription stores.
//!
//! These are the store implementations the replication layer ships with.
//! Contents are rebuilt from the raft log and snapshots on restart, so the
//! lack of their own disk persistence does not lose committed data on a
//! node that can still catch up from the cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::Message;

use super::{MessageStore, SubState, SubscriptionStore};

#[derive(Debug, Default)]
struct MsgStoreInner {
    first: u64,
    last: u64,
    messages: BTreeMap<u64, Message>,
}

/// In-memory, sequence-indexed message store.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    inner: RwLock<MsgStoreInner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MsgStoreInner>> {
        self.inner
            .read()
            .map_err(|_| Error::Store("message store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MsgStoreInner>> {
        self.inner
            .write()
            .map_err(|_| Error::Store("message store lock poisoned".into()))
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, data: Bytes, timestamp: i64) -> Result<u64> {
        let mut inner = self.write()?;
        let sequence = inner.last + 1;
        inner.messages.insert(
            sequence,
            Message {
                sequence,
                data,
                timestamp,
            },
        );
        inner.last = sequence;
        if inner.first == 0 {
            inner.first = sequence;
        }
        Ok(sequence)
    }

    fn lookup(&self, sequence: u64) -> Result<Option<Message>> {
        Ok(self.read()?.messages.get(&sequence).cloned())
    }

    fn first_and_last_sequence(&self) -> Result<(u64, u64)> {
        let inner = self.read()?;
        Ok((inner.first, inner.last))
    }

    fn truncate_from(&self, from: u64) -> Result<()> {
        let mut inner = self.write()?;
        let doomed: Vec<u64> = inner.messages.range(from..).map(|(k, _)| *k).collect();
        for seq in doomed {
            inner.messages.remove(&seq);
        }
        inner.last = from.saturating_sub(1);
        if inner.last < inner.first {
            inner.first = 0;
            inner.last = 0;
        }
        Ok(())
    }

    fn restore(&self, first: u64, last: u64, messages: Vec<Message>) -> Result<()> {
        let rebuilt: BTreeMap<u64, Message> =
            messages.into_iter().map(|m| (m.sequence, m)).collect();
        let mut inner = self.write()?;
        inner.first = first;
        inner.last = last;
        inner.messages = rebuilt;
        Ok(())
    }

    fn all_messages(&self) -> Result<Vec<Message>> {
        Ok(self.read()?.messages.values().cloned().collect())
    }
}

/// In-memory subscription store.
#[derive(Debug, Default)]
pub struct MemorySubStore {
    inner: RwLock<HashMap<u64, SubState>>,
}

impl MemorySubStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<u64, SubState>>> {
        self.inner
            .read()
            .map_err(|_| Error::Store("subscription store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<u64, SubState>>> {
        self.inner
            .write()
            .map_err(|_| Error::Store("subscription store lock poisoned".into()))
    }
}

impl SubscriptionStore for MemorySubStore {
    fn create_sub(&self, sub: SubState) -> Result<()> {
        let mut inner = self.write()?;
        if inner.contains_key(&sub.id) {
            return Err(Error::Store(format!("subscription {} already exists", sub.id)));
        }
        inner.insert(sub.id, sub);
        Ok(())
    }

    fn update_sub(&self, sub: SubState) -> Result<()> {
        let mut inner = self.write()?;
        match inner.get_mut(&sub.id) {
            Some(existing) => {
                *existing = sub;
                Ok(())
            }
            None => Err(Error::UnknownSubscription(sub.id)),
        }
    }

    fn delete_sub(&self, sub_id: u64) -> Result<()> {
        self.write()?.remove(&sub_id);
        Ok(())
    }

    fn lookup(&self, sub_id: u64) -> Result<Option<SubState>> {
        Ok(self.read()?.get(&sub_id).cloned())
    }

    fn lookup_by_durable_name(&self, name: &str) -> Result<Option<SubState>> {
        Ok(self
            .read()?
            .values()
            .find(|s| s.queue_group.is_none() && s.durable_name.as_deref() == Some(name))
            .cloned())
    }

    fn lookup_by_queue_group(&self, group: &str) -> Result<Option<SubState>> {
        Ok(self
            .read()?
            .values()
            .find(|s| s.queue_group.as_deref() == Some(group))
            .cloned())
    }

    fn all_subs(&self) -> Result<Vec<SubState>> {
        let mut subs: Vec<SubState> = self.read()?.values().cloned().collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    fn restore(&self, subs: Vec<SubState>) -> Result<()> {
        let rebuilt: HashMap<u64, SubState> = subs.into_iter().map(|s| (s.id, s)).collect();
        *self.write()? = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(id: u64, durable: Option<&str>) -> SubState {
        SubState {
            id,
            client_id: "client".into(),
            durable_name: durable.map(String::from),
            queue_group: None,
            start_seq: 1,
            last_sent: 0,
            last_acked: 0,
            closed: false,
        }
    }

    #[test]
    fn append_assigns_contiguous_sequences() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.append(Bytes::from_static(b"a"), 1).unwrap(), 1);
        assert_eq!(store.append(Bytes::from_static(b"b"), 2).unwrap(), 2);
        assert_eq!(store.append(Bytes::from_static(b"c"), 3).unwrap(), 3);
        assert_eq!(store.first_and_last_sequence().unwrap(), (1, 3));
    }

    #[test]
    fn empty_store_reports_zero_range() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.first_and_last_sequence().unwrap(), (0, 0));
        assert!(store.lookup(1).unwrap().is_none());
    }

    #[test]
    fn lookup_returns_stored_data() {
        let store = MemoryMessageStore::new();
        store.append(Bytes::from_static(b"hello"), 42).unwrap();
        let msg = store.lookup(1).unwrap().unwrap();
        assert_eq!(msg.sequence, 1);
        assert_eq!(&msg.data[..], b"hello");
        assert_eq!(msg.timestamp, 42);
    }

    #[test]
    fn truncate_from_drops_tail() {
        let store = MemoryMessageStore::new();
        for i in 0..5 {
            store.append(Bytes::from(vec![i]), i as i64).unwrap();
        }
        store.truncate_from(3).unwrap();
        assert_eq!(store.first_and_last_sequence().unwrap(), (1, 2));
        assert!(store.lookup(3).unwrap().is_none());
        assert!(store.lookup(2).unwrap().is_some());
        // Appending resumes from the truncation point.
        assert_eq!(store.append(Bytes::from_static(b"x"), 0).unwrap(), 3);
    }

    #[test]
    fn restore_replaces_contents() {
        let store = MemoryMessageStore::new();
        store.append(Bytes::from_static(b"old"), 0).unwrap();

        let messages = vec![
            Message {
                sequence: 4,
                data: Bytes::from_static(b"m4"),
                timestamp: 0,
            },
            Message {
                sequence: 5,
                data: Bytes::from_static(b"m5"),
                timestamp: 0,
            },
        ];
        store.restore(4, 5, messages).unwrap();

        assert_eq!(store.first_and_last_sequence().unwrap(), (4, 5));
        assert!(store.lookup(1).unwrap().is_none());
        assert_eq!(&store.lookup(5).unwrap().unwrap().data[..], b"m5");
        // Sequence numbering continues from the restored tail.
        assert_eq!(store.append(Bytes::from_static(b"m6"), 0).unwrap(), 6);
    }

    #[test]
    fn sub_create_and_lookup() {
        let store = MemorySubStore::new();
        store.create_sub(sub(1, Some("dur"))).unwrap();
        assert!(store.lookup(1).unwrap().is_some());
        assert!(store.lookup(2).unwrap().is_none());
        assert_eq!(
            store.lookup_by_durable_name("dur").unwrap().unwrap().id,
            1
        );
        assert!(store.lookup_by_durable_name("other").unwrap().is_none());
    }

    #[test]
    fn sub_create_duplicate_id_rejected() {
        let store = MemorySubStore::new();
        store.create_sub(sub(1, None)).unwrap();
        assert!(store.create_sub(sub(1, None)).is_err());
    }

    #[test]
    fn sub_update_unknown_rejected() {
        let store = MemorySubStore::new();
        assert!(matches!(
            store.update_sub(sub(9, None)),
            Err(Error::UnknownSubscription(9))
        ));
    }

    #[test]
    fn sub_delete_then_lookup_none() {
        let store = MemorySubStore::new();
        store.create_sub(sub(1, Some("dur"))).unwrap();
        store.delete_sub(1).unwrap();
        assert!(store.lookup(1).unwrap().is_none());
        assert!(store.lookup_by_durable_name("dur").unwrap().is_none());
    }

    #[test]
    fn durable_lookup_ignores_queue_members() {
        let store = MemorySubStore::new();
        let mut queue_sub = sub(1, Some("dur"));
        queue_sub.queue_group = Some("workers".into());
        store.create_sub(queue_sub).unwrap();
        assert!(store.lookup_by_durable_name("dur").unwrap().is_none());
    }

    #[test]
    fn restore_replaces_subs() {
        let store = MemorySubStore::new();
        store.create_sub(sub(1, None)).unwrap();
        store.restore(vec![sub(7, Some("d"))]).unwrap();
        assert!(store.lookup(1).unwrap().is_none());
        assert!(store.lookup(7).unwrap().is_some());
    }
}
