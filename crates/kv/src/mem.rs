//! In-memory reference store.

use crate::{cursor::KvPair, Bucket, Cursor, KvError, KvRead, KvWrite, PutTuple};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
};

type BucketMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory ordered store.
///
/// Buckets are copy-on-write [`BTreeMap`]s behind one lock; cursors hold an
/// `Arc` snapshot of their bucket, so open cursors keep reading the state
/// they were opened against while writers move the store forward.
#[derive(Debug, Default)]
pub struct MemKv {
    buckets: RwLock<HashMap<Bucket, Arc<BucketMap>>>,
}

impl MemKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, bucket: Bucket) -> Arc<BucketMap> {
        self.buckets.read().get(bucket).cloned().unwrap_or_default()
    }
}

impl KvRead for MemKv {
    type Cursor = MemCursor;

    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>, KvError> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|map| map.get(key).cloned())
            .ok_or(KvError::NotFound)
    }

    fn cursor(&self, bucket: Bucket) -> Result<Self::Cursor, KvError> {
        Ok(MemCursor { map: self.snapshot(bucket), pos: Pos::Start })
    }
}

impl KvWrite for MemKv {
    fn put(&self, bucket: Bucket, key: Vec<u8>, value: Vec<u8>) -> Result<(), KvError> {
        let mut buckets = self.buckets.write();
        Arc::make_mut(buckets.entry(bucket).or_default()).insert(key, value);
        Ok(())
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<(), KvError> {
        let mut buckets = self.buckets.write();
        if let Some(map) = buckets.get_mut(bucket) {
            Arc::make_mut(map).remove(key);
        }
        Ok(())
    }

    fn multi_put(&self, tuples: Vec<PutTuple>) -> Result<(), KvError> {
        // One lock acquisition for the whole batch keeps it atomic for
        // readers opening cursors concurrently.
        let mut buckets = self.buckets.write();
        for (bucket, key, value) in tuples {
            Arc::make_mut(buckets.entry(bucket).or_default()).insert(key, value);
        }
        Ok(())
    }

    fn ideal_batch_size(&self) -> usize {
        1024
    }
}

#[derive(Debug, Clone)]
enum Pos {
    /// Before the first entry.
    Start,
    /// On the entry with this key.
    At(Vec<u8>),
    /// Parked at an unoccupied key after a failed seek.
    Bound(Vec<u8>),
    /// Past the last entry.
    End,
}

/// Snapshot cursor over one [`MemKv`] bucket.
#[derive(Debug)]
pub struct MemCursor {
    map: Arc<BucketMap>,
    pos: Pos,
}

impl MemCursor {
    fn settle(&mut self, entry: Option<KvPair>, miss: Pos) -> Option<KvPair> {
        match entry {
            Some((key, value)) => {
                self.pos = Pos::At(key.clone());
                Some((key, value))
            }
            None => {
                self.pos = miss;
                None
            }
        }
    }
}

fn cloned(entry: Option<(&Vec<u8>, &Vec<u8>)>) -> Option<KvPair> {
    entry.map(|(k, v)| (k.clone(), v.clone()))
}

impl Cursor for MemCursor {
    fn first(&mut self) -> Result<Option<KvPair>, KvError> {
        let entry = cloned(self.map.iter().next());
        Ok(self.settle(entry, Pos::End))
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, KvError> {
        let entry = cloned(self.map.range(key.to_vec()..).next());
        Ok(self.settle(entry, Pos::Bound(key.to_vec())))
    }

    fn next(&mut self) -> Result<Option<KvPair>, KvError> {
        let entry = match &self.pos {
            Pos::Start => cloned(self.map.iter().next()),
            Pos::At(key) => {
                cloned(self.map.range((Bound::Excluded(key.clone()), Bound::Unbounded)).next())
            }
            Pos::Bound(key) => cloned(self.map.range(key.clone()..).next()),
            Pos::End => None,
        };
        Ok(self.settle(entry, Pos::End))
    }

    fn prev(&mut self) -> Result<Option<KvPair>, KvError> {
        let entry = match &self.pos {
            Pos::Start => None,
            Pos::At(key) | Pos::Bound(key) => cloned(self.map.range(..key.clone()).next_back()),
            Pos::End => cloned(self.map.iter().next_back()),
        };
        Ok(self.settle(entry, Pos::Start))
    }
}
