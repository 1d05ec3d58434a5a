use crate::DBCol;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use strum::EnumCount;

pub type DBIterator<'a> = Box<dyn Iterator<Item = io::Result<(Box<[u8]>, Box<[u8]>)>> + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DBOp {
    Set { col: DBCol, key: Vec<u8>, value: Vec<u8> },
    Delete { col: DBCol, key: Vec<u8> },
    DeleteAll { col: DBCol },
}

/// Batch of operations applied atomically: either every op lands or none
/// does.
#[derive(Debug, Default, Clone)]
pub struct DBTransaction {
    pub ops: Vec<DBOp>,
}

impl DBTransaction {
    pub fn set(&mut self, col: DBCol, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(DBOp::Set { col, key, value });
    }

    pub fn delete(&mut self, col: DBCol, key: Vec<u8>) {
        self.ops.push(DBOp::Delete { col, key });
    }

    pub fn delete_all(&mut self, col: DBCol) {
        self.ops.push(DBOp::DeleteAll { col });
    }
}

/// The storage contract. Implementations must make `write` atomic with
/// respect to concurrent reads and other writes.
pub trait Database: Send + Sync {
    fn get_raw_bytes(&self, col: DBCol, key: &[u8]) -> io::Result<Option<Vec<u8>>>;

    /// Iterates over rows whose key starts with `prefix`, in key order.
    fn iter_prefix(&self, col: DBCol, prefix: &[u8]) -> DBIterator<'_>;

    fn write(&self, transaction: DBTransaction) -> io::Result<()>;
}

/// In-memory [`Database`], used in tests and as the reference semantics for
/// real backends.
#[derive(Default)]
pub struct TestDB {
    data: RwLock<[BTreeMap<Vec<u8>, Vec<u8>>; DBCol::COUNT]>,
    /// When set, the next write fails without applying anything. Lets tests
    /// exercise the no-partial-update guarantees of callers.
    fail_next_write: RwLock<bool>,
}

impl TestDB {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_write(&self) {
        *self.fail_next_write.write() = true;
    }
}

impl Database for TestDB {
    fn get_raw_bytes(&self, col: DBCol, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.read()[col as usize].get(key).cloned())
    }

    fn iter_prefix(&self, col: DBCol, prefix: &[u8]) -> DBIterator<'_> {
        let rows: Vec<_> = self.data.read()[col as usize]
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| {
                Ok((key.clone().into_boxed_slice(), value.clone().into_boxed_slice()))
            })
            .collect();
        Box::new(rows.into_iter())
    }

    fn write(&self, transaction: DBTransaction) -> io::Result<()> {
        if std::mem::take(&mut *self.fail_next_write.write()) {
            return Err(io::Error::other("injected write failure"));
        }
        let mut data = self.data.write();
        for op in transaction.ops {
            match op {
                DBOp::Set { col, key, value } => {
                    data[col as usize].insert(key, value);
                }
                DBOp::Delete { col, key } => {
                    data[col as usize].remove(&key);
                }
                DBOp::DeleteAll { col } => {
                    data[col as usize].clear();
                }
            }
        }
        Ok(())
    }
}
