//! Reference-counted export table.
//!
//! Objects handed to the remote peer are keyed by stable integer OIDs.
//! OID 0 is reserved for null. Entries are reference-counted; when the
//! count reaches zero the entry moves into a bounded unexport log so that
//! a later lookup of the stale OID can report where the object was
//! allocated and where it was released.

use crate::error::ChannelError;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

/// Added by `pin` so that over-releases never reach zero.
const PIN_BIAS: u32 = 0x4000_0000;
/// Entries already counted above this are considered pinned.
const PIN_THRESHOLD: u32 = 0x2000_0000;

/// Implemented by exported objects that want to hear about channel death,
/// e.g. pipe sinks whose blocked readers must wake up.
pub trait ErrorPropagating: Send + Sync {
    fn propagate(&self, cause: &str);
}

/// Where and when an entry was allocated or released.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub at: SystemTime,
    pub backtrace: String,
}

impl TraceRecord {
    fn capture() -> Self {
        Self {
            at: SystemTime::now(),
            backtrace: Backtrace::capture().to_string(),
        }
    }
}

struct Entry {
    object: Arc<dyn Any + Send + Sync>,
    hook: Option<Arc<dyn ErrorPropagating>>,
    interfaces: BTreeSet<&'static str>,
    reference_count: u32,
    allocated: TraceRecord,
}

struct LogRecord {
    id: u64,
    interfaces: BTreeSet<&'static str>,
    allocated: TraceRecord,
    released: TraceRecord,
}

struct Inner {
    /// Next OID to allocate; 0 is reserved for null.
    iota: u64,
    table: HashMap<u64, Entry>,
    /// Object identity (allocation address) to OID, for re-export dedup.
    reverse: HashMap<usize, u64>,
    unexport_log: VecDeque<LogRecord>,
}

/// Registry of objects exposed to the remote peer.
pub struct ExportTable {
    inner: Mutex<Inner>,
    log_size: usize,
}

impl ExportTable {
    pub fn new(log_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                iota: 1,
                table: HashMap::new(),
                reverse: HashMap::new(),
                unexport_log: VecDeque::new(),
            }),
            log_size,
        }
    }

    /// Exports `object`, returning its OID.
    ///
    /// Re-exporting the same object (by identity) increments its reference
    /// count and unions the interface set instead of allocating a new OID.
    pub fn export<T: Any + Send + Sync>(
        &self,
        object: Arc<T>,
        hook: Option<Arc<dyn ErrorPropagating>>,
    ) -> u64 {
        let key = Arc::as_ptr(&object) as *const () as usize;
        let interface = std::any::type_name::<T>();
        let mut inner = self.inner.lock();

        let existing = inner.reverse.get(&key).copied();
        if let Some(id) = existing {
            if let Some(entry) = inner.table.get_mut(&id) {
                entry.reference_count += 1;
                entry.interfaces.insert(interface);
                return id;
            }
        }

        let id = inner.iota;
        inner.iota += 1;
        let mut interfaces = BTreeSet::new();
        interfaces.insert(interface);
        inner.table.insert(
            id,
            Entry {
                object,
                hook,
                interfaces,
                reference_count: 1,
                allocated: TraceRecord::capture(),
            },
        );
        inner.reverse.insert(key, id);
        tracing::debug!(oid = id, interface, "exported object");
        id
    }

    /// Looks up an exported object, with log-enriched stale-OID diagnostics.
    pub fn get(&self, oid: u64) -> Result<Arc<dyn Any + Send + Sync>, ChannelError> {
        let inner = self.inner.lock();
        match inner.table.get(&oid) {
            Some(entry) => Ok(entry.object.clone()),
            None => Err(Self::diagnose(&inner, oid)),
        }
    }

    /// Decrements the reference count; releases the entry when it hits zero.
    ///
    /// Releasing an OID that is not in the table is tolerated: the enriched
    /// diagnostic is logged but the channel survives, since a racing
    /// explicit close and drop of the same pipe is legal.
    pub fn unexport(&self, oid: u64) {
        if oid == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.table.contains_key(&oid) {
            let err = Self::diagnose(&inner, oid);
            tracing::warn!("unexport of unknown object: {err}");
            return;
        }
        let released = match inner.table.get_mut(&oid) {
            Some(entry) => {
                entry.reference_count -= 1;
                entry.reference_count == 0
            }
            None => false,
        };
        if !released {
            return;
        }

        let Some(entry) = inner.table.remove(&oid) else {
            return;
        };
        let key = Arc::as_ptr(&entry.object) as *const () as usize;
        inner.reverse.remove(&key);
        inner.unexport_log.push_back(LogRecord {
            id: oid,
            interfaces: entry.interfaces,
            allocated: entry.allocated,
            released: TraceRecord::capture(),
        });
        while inner.unexport_log.len() > self.log_size {
            inner.unexport_log.pop_front();
        }
        tracing::debug!(oid, "unexported object");
    }

    /// Biases the reference count so over-releases cannot deallocate.
    pub fn pin(&self, oid: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.table.get_mut(&oid) {
            if entry.reference_count < PIN_THRESHOLD {
                entry.reference_count += PIN_BIAS;
            }
        }
    }

    /// Current reference count, for diagnostics and tests.
    pub fn reference_count(&self, oid: u64) -> Option<u32> {
        self.inner.lock().table.get(&oid).map(|e| e.reference_count)
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Propagates `cause` to every entry that asked to hear about channel
    /// death, then clears the table. Aborted entries are deliberately not
    /// added to the unexport log; the channel itself is gone.
    pub fn abort(&self, cause: &str) {
        let hooks: Vec<Arc<dyn ErrorPropagating>> = {
            let mut inner = self.inner.lock();
            let hooks = inner
                .table
                .values()
                .filter_map(|e| e.hook.clone())
                .collect();
            inner.table.clear();
            inner.reverse.clear();
            hooks
        };
        for hook in hooks {
            hook.propagate(cause);
        }
    }

    /// Renders live entries for inspection.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut ids: Vec<&u64> = inner.table.keys().collect();
        ids.sort();
        let mut out = String::new();
        for id in ids {
            let entry = &inner.table[id];
            out.push_str(&format!(
                "#{} (ref.{}) : {:?}\n",
                id, entry.reference_count, entry.interfaces
            ));
        }
        out
    }

    fn diagnose(inner: &Inner, oid: u64) -> ChannelError {
        let mut diagnostics = String::new();
        for record in &inner.unexport_log {
            if record.id == oid {
                diagnostics = format!(
                    "\nobject was recently released\n  interfaces: {:?}\n  allocated at {:?}:\n{}  released at {:?}:\n{}",
                    record.interfaces,
                    record.allocated.at,
                    indent(&record.allocated.backtrace),
                    record.released.at,
                    indent(&record.released.backtrace),
                );
                break;
            }
        }
        if diagnostics.is_empty() && !inner.unexport_log.is_empty() {
            let oldest = &inner.unexport_log[0];
            diagnostics = format!(
                " (not in the last {} unexports; oldest retained release was at {:?})",
                inner.unexport_log.len(),
                oldest.released.at
            );
        }
        ChannelError::InvalidObjectId { id: oid, diagnostics }
    }
}

fn indent(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.lines().take(16) {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_allocates_sequential_oids() {
        let table = ExportTable::new(16);
        let a = table.export(Arc::new("a".to_string()), None);
        let b = table.export(Arc::new("b".to_string()), None);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn test_reexport_same_object_increments_refcount() {
        let table = ExportTable::new(16);
        let obj = Arc::new(42u64);
        let first = table.export(obj.clone(), None);
        let second = table.export(obj.clone(), None);
        assert_eq!(first, second);
        assert_eq!(table.reference_count(first), Some(2));

        table.unexport(first);
        assert_eq!(table.count(), 1);
        table.unexport(first);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_get_returns_exported_object() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new(7u32), None);
        let object = table.get(oid).unwrap();
        assert_eq!(*object.downcast::<u32>().unwrap(), 7);
    }

    #[test]
    fn test_stale_oid_diagnostic_carries_traces() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new("gone".to_string()), None);
        table.unexport(oid);

        let err = table.get(oid).unwrap_err();
        match err {
            ChannelError::InvalidObjectId { id, diagnostics } => {
                assert_eq!(id, oid);
                assert!(diagnostics.contains("recently released"));
                assert!(diagnostics.contains("allocated at"));
                assert!(diagnostics.contains("released at"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unexport_log_is_bounded() {
        let table = ExportTable::new(4);
        let mut oids = Vec::new();
        for i in 0..10u64 {
            let oid = table.export(Arc::new(i), None);
            oids.push(oid);
            table.unexport(oid);
        }
        // The oldest releases fell out of the log.
        let err = table.get(oids[0]).unwrap_err();
        match err {
            ChannelError::InvalidObjectId { diagnostics, .. } => {
                assert!(!diagnostics.contains("recently released"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pin_survives_over_release() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new("pinned".to_string()), None);
        table.pin(oid);
        for _ in 0..100 {
            table.unexport(oid);
        }
        assert_eq!(table.count(), 1);
        assert!(table.get(oid).is_ok());
    }

    #[test]
    fn test_double_pin_does_not_rebias() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new(1u8), None);
        table.pin(oid);
        let once = table.reference_count(oid).unwrap();
        table.pin(oid);
        assert_eq!(table.reference_count(oid), Some(once));
    }

    #[test]
    fn test_double_unexport_tolerated() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new(1u8), None);
        table.unexport(oid);
        table.unexport(oid);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_abort_propagates_and_clears() {
        struct Hook(Mutex<Option<String>>);
        impl ErrorPropagating for Hook {
            fn propagate(&self, cause: &str) {
                *self.0.lock() = Some(cause.to_string());
            }
        }

        let table = ExportTable::new(16);
        let hook = Arc::new(Hook(Mutex::new(None)));
        table.export(hook.clone(), Some(hook.clone()));
        table.export(Arc::new("plain".to_string()), None);

        table.abort("connection reset");
        assert_eq!(table.count(), 0);
        assert_eq!(hook.0.lock().as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_dump_lists_entries() {
        let table = ExportTable::new(16);
        let oid = table.export(Arc::new("x".to_string()), None);
        let dump = table.dump();
        assert!(dump.contains(&format!("#{oid}")));
        assert!(dump.contains("ref.1"));
    }
}
