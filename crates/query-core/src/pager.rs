//! Request-scoped pagination state.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Offset/limit window handed to the backend with an enumerable command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataSegment {
    pub offset: u64,
    pub limit: u64,
}

impl DataSegment {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagerState {
    pub offset: u64,
    pub limit: u64,
    /// Total rows matched by the unpaged query, once known
    pub record_count: Option<u64>,
}

/// Shared pager handle. Created by the caller per request, read by the plan
/// builder and written back with the total row count after execution.
#[derive(Clone)]
pub struct Pager(Arc<Mutex<PagerState>>);

impl Pager {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self(Arc::new(Mutex::new(PagerState {
            offset,
            limit,
            record_count: None,
        })))
    }

    pub fn state(&self) -> PagerState {
        *self.0.lock()
    }

    pub fn segment(&self) -> DataSegment {
        let state = self.0.lock();
        DataSegment::new(state.offset, state.limit)
    }

    pub fn offset(&self) -> u64 {
        self.0.lock().offset
    }

    pub fn limit(&self) -> u64 {
        self.0.lock().limit
    }

    pub fn set_offset(&self, offset: u64) {
        self.0.lock().offset = offset;
    }

    pub fn record_count(&self) -> Option<u64> {
        self.0.lock().record_count
    }

    pub fn set_record_count(&self, total: u64) {
        self.0.lock().record_count = Some(total);
    }

    pub fn ptr_eq(&self, other: &Pager) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Pager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pager").field(&self.state()).finish()
    }
}

/// Values that embed a pager and can be re-pointed at another request's pager.
pub trait PagerBound: Sized {
    fn bound_pager(&self) -> Option<&Pager>;

    fn rebind_pager(&self, pager: &Pager) -> Self;
}
