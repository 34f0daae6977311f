//! Per-type codec contract
//!
//! Every kind of metadata block registers an [`EntryClient`]: the cache
//! treats the in-memory object as opaque and calls back into the client to
//! size, decode, encode, and free it, and to deliver lifecycle
//! notifications. A client failure aborts the load or flush pass that
//! invoked it; the cache never retries on the client's behalf.

use bytes::Bytes;
use std::any::Any;
use std::fmt;
use tessera_common::{EntryTypeId, Result};

/// The opaque in-memory representation of one metadata block
pub type Object = Box<dyn Any>;

/// Lifecycle notifications delivered to a client about its entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyAction {
    /// Entry was inserted into the cache as a new object
    AfterInsert,
    /// Entry was loaded from storage (or upgraded from a placeholder)
    AfterLoad,
    /// Entry is about to be written to storage
    BeforeFlush,
    /// Entry was written to storage
    AfterFlush,
    /// Entry is about to be evicted from the cache
    BeforeEvict,
    /// Entry transitioned clean to dirty
    EntryDirtied,
    /// Entry transitioned dirty to clean
    EntryCleaned,
    /// A flush-dependency child of this entry was dirtied
    ChildDirtied,
    /// A flush-dependency child of this entry was cleaned
    ChildCleaned,
}

impl fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AfterInsert => "after-insert",
            Self::AfterLoad => "after-load",
            Self::BeforeFlush => "before-flush",
            Self::AfterFlush => "after-flush",
            Self::BeforeEvict => "before-evict",
            Self::EntryDirtied => "entry-dirtied",
            Self::EntryCleaned => "entry-cleaned",
            Self::ChildDirtied => "child-dirtied",
            Self::ChildCleaned => "child-cleaned",
        };
        f.write_str(s)
    }
}

/// Codec and lifecycle capability for one metadata entry type
pub trait EntryClient {
    /// Type id recorded in the index and in cache images
    ///
    /// Not named `type_id` to keep it from shadowing (or being shadowed by)
    /// `std::any::Any::type_id` on trait objects.
    fn entry_type_id(&self) -> EntryTypeId;

    /// Number of bytes to read from storage for the initial load
    fn load_size(&self, udata: &dyn Any) -> Result<u64>;

    /// Decode `image` into a live object
    ///
    /// Returns the object and whether it is dirty on arrival (a client may
    /// repair a stale on-disk representation during decode).
    fn deserialize(&self, image: &[u8], udata: &dyn Any) -> Result<(Object, bool)>;

    /// Encode `object` into exactly `len` bytes
    fn serialize(&self, object: &dyn Any, len: u64) -> Result<Bytes>;

    /// Release an object on eviction or cache teardown
    fn free(&self, object: Object) -> Result<()> {
        drop(object);
        Ok(())
    }

    /// Lifecycle notification; the default ignores all actions
    fn notify(&self, action: NotifyAction, object: &mut dyn Any) -> Result<()> {
        let _ = (action, object);
        Ok(())
    }
}
