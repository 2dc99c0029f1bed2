//! Host port allocation
//!
//! Ports are never handed back explicitly. A port becomes free again when the
//! service that held it is deleted, and is picked up the next time the cursor
//! wraps around and scans for gaps.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::db::Database;

/// Hands out host ports not recorded against any service
pub struct PortAllocator {
    db: Arc<Database>,
    base: u16,
    cursor: Mutex<u16>,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(db: Arc<Database>, base: u16) -> Self {
        Self {
            db,
            base,
            cursor: Mutex::new(base),
            probe_host: false,
        }
    }

    /// Also skip ports that another process on this host is listening on
    pub fn with_host_probe(mut self) -> Self {
        self.probe_host = true;
        self
    }

    /// Return a port no service currently owns and advance past it
    pub fn allocate(&self) -> Result<u16> {
        let used: HashSet<u16> = self.db.allocated_ports()?.into_iter().collect();
        let mut cursor = self.cursor.lock();

        // Walk forward from the cursor, then once more from the base to pick
        // up gaps left by deleted services.
        let start = (*cursor).max(self.base);
        let candidates = (start..=u16::MAX).chain(self.base..start);

        for port in candidates {
            if used.contains(&port) {
                continue;
            }
            if self.probe_host && !ensure_free(port) {
                debug!(port, "Port held by a foreign process, skipping");
                continue;
            }
            *cursor = port.checked_add(1).unwrap_or(self.base);
            debug!(port, "Allocated port");
            return Ok(port);
        }

        anyhow::bail!("No free ports left in range {}-{}", self.base, u16::MAX)
    }
}

/// Whether the host can bind `port` on the loopback interface right now
pub fn ensure_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateOutcome, ResourceLimits, ServiceRecord, SourceType};

    fn service(db: &Database, name: &str, port: u16) -> ServiceRecord {
        let mut record = ServiceRecord::new_app(
            name,
            SourceType::Upload,
            ResourceLimits {
                cpu: 0.25,
                memory: 268_435_456,
            },
        );
        record.port = Some(port);
        assert_eq!(db.try_create_service(&record).unwrap(), CreateOutcome::Created);
        record
    }

    #[test]
    fn test_allocate_sequential() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let allocator = PortAllocator::new(db, 4001);
        assert_eq!(allocator.allocate().unwrap(), 4001);
        assert_eq!(allocator.allocate().unwrap(), 4002);
        assert_eq!(allocator.allocate().unwrap(), 4003);
    }

    #[test]
    fn test_allocate_skips_used_ports() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        service(&db, "a", 4001);
        service(&db, "b", 4002);
        service(&db, "c", 4004);

        let allocator = PortAllocator::new(db, 4001);
        assert_eq!(allocator.allocate().unwrap(), 4003);
        assert_eq!(allocator.allocate().unwrap(), 4005);
    }

    #[test]
    fn test_freed_port_not_reused_eagerly() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let allocator = PortAllocator::new(db.clone(), 4001);

        let port = allocator.allocate().unwrap();
        let record = service(&db, "a", port);
        db.delete_service(&record.id).unwrap();

        assert_eq!(allocator.allocate().unwrap(), 4002);
    }

    #[test]
    fn test_wraps_to_base_after_top() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        service(&db, "top", 65535);

        let allocator = PortAllocator::new(db, 65533);
        assert_eq!(allocator.allocate().unwrap(), 65533);
        assert_eq!(allocator.allocate().unwrap(), 65534);
        // 65535 is taken, so the scan wraps back to the base
        assert_eq!(allocator.allocate().unwrap(), 65533);
    }

    #[test]
    fn test_wrap_finds_freed_gap() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let allocator = PortAllocator::new(db.clone(), 65533);

        let first = service(&db, "a", allocator.allocate().unwrap());
        service(&db, "b", allocator.allocate().unwrap());
        service(&db, "c", allocator.allocate().unwrap());
        assert!(allocator.allocate().is_err());

        db.delete_service(&first.id).unwrap();
        assert_eq!(allocator.allocate().unwrap(), 65533);
    }

    #[test]
    fn test_ensure_free_detects_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!ensure_free(port));
    }
}
