use sled::{Db, IVec, Tree};
use tracing::debug;

use crate::utils::{BrokerError, Result};

/// Sequence number given to the first record of an empty queue. Starting
/// mid-range leaves room below it for `prepend`.
const START_SEQ: u64 = 1 << 63;

const DEFAULT_TREE: &[u8] = b"__sled__default";

/// Handle to the `sled` database holding every overflow queue.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create the store at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A store that lives only as long as this process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn open_queue(&self, name: &str) -> Result<DiskQueue> {
        let tree = self.db.open_tree(name)?;
        DiskQueue::new(name, tree)
    }

    /// Delete a queue and everything in it.
    pub fn drop_queue(&self, name: &str) -> Result<()> {
        self.db.drop_tree(name)?;
        Ok(())
    }

    /// Names of every queue present in the store.
    pub fn queue_names(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter(|n| &n[..] != DEFAULT_TREE)
            .filter_map(|n| String::from_utf8(n.to_vec()).ok())
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}

/// Strict FIFO of byte records backed by one `sled` tree.
///
/// `head` is the key of the next record to read and `tail` the key the next
/// append will use; both are recovered from the tree on open.
pub struct DiskQueue {
    name: String,
    tree: Tree,
    head: u64,
    tail: u64,
}

impl DiskQueue {
    fn new(name: &str, tree: Tree) -> Result<Self> {
        let head = match tree.first()? {
            Some((k, _)) => decode_key(&k)?,
            None => START_SEQ,
        };
        let tail = match tree.last()? {
            Some((k, _)) => decode_key(&k)? + 1,
            None => head,
        };
        if tail > head {
            debug!(queue = name, depth = tail - head, "recovered overflow queue");
        }
        Ok(Self {
            name: name.to_string(),
            tree,
            head,
            tail,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record at the back. Returns its position.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let pos = self.tail;
        self.tree.insert(pos.to_be_bytes(), bytes)?;
        self.tail += 1;
        Ok(pos)
    }

    /// Insert a record ahead of everything else in the queue.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<u64> {
        let pos = self
            .head
            .checked_sub(1)
            .ok_or_else(|| BrokerError::Corrupt(format!("{}: sequence underflow", self.name)))?;
        self.tree.insert(pos.to_be_bytes(), bytes)?;
        self.head = pos;
        Ok(pos)
    }

    /// Remove and return the oldest record, or `None` when drained.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.head == self.tail {
            return Ok(None);
        }
        match self.tree.pop_min()? {
            Some((k, v)) => {
                self.head = decode_key(&k)? + 1;
                Ok(Some(v.to_vec()))
            }
            None => {
                self.head = self.tail;
                Ok(None)
            }
        }
    }

    pub fn depth(&self) -> u64 {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Durability barrier: everything appended so far survives a crash.
    pub fn sync(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }

    /// Discard every record.
    pub fn clear(&mut self) -> Result<()> {
        self.tree.clear()?;
        self.head = START_SEQ;
        self.tail = START_SEQ;
        Ok(())
    }
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("name", &self.name)
            .field("depth", &self.depth())
            .finish()
    }
}

fn decode_key(key: &IVec) -> Result<u64> {
    let bytes: [u8; 8] = key[..]
        .try_into()
        .map_err(|_| BrokerError::Corrupt(format!("overflow key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
