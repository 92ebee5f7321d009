//! Port leases
//!
//! Leases are tracked in memory so concurrent sessions never share a port,
//! and every candidate is also probed with a real bind so ports held by
//! processes outside this service are skipped.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::types::ErrorKind;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free {purpose} port in {start}..{end}")]
    Exhausted {
        purpose: PortPurpose,
        start: u16,
        end: u32,
    },
}

impl PortError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ResourceError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortPurpose {
    Frontend,
    Backend,
}

impl std::fmt::Display for PortPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortPurpose::Frontend => write!(f, "frontend"),
            PortPurpose::Backend => write!(f, "backend"),
        }
    }
}

type Leased = Arc<Mutex<HashSet<u16>>>;

/// Hands out port leases within a window above a base port
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    leased: Leased,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the first free port in `[base, base + window)`
    ///
    /// The search starts at `preferred` when it lies inside the window and
    /// wraps around to `base`.
    pub fn lease(
        &self,
        purpose: PortPurpose,
        base: u16,
        window: u16,
        preferred: Option<u16>,
    ) -> Result<PortLease, PortError> {
        let end = (u32::from(base) + u32::from(window)).min(u32::from(u16::MAX) + 1);
        let in_window = |p: u16| p >= base && u32::from(p) < end;
        let start = preferred.filter(|p| in_window(*p)).unwrap_or(base);

        let candidates = (u32::from(start)..end).chain(u32::from(base)..u32::from(start));

        let mut leased = self.leased.lock().unwrap_or_else(PoisonError::into_inner);
        for candidate in candidates {
            let Ok(port) = u16::try_from(candidate) else {
                continue;
            };
            if port == 0 || leased.contains(&port) || !is_bindable(port) {
                continue;
            }
            leased.insert(port);
            debug!(port, %purpose, "port leased");
            return Ok(PortLease {
                port,
                purpose,
                leased: Some(self.leased.clone()),
            });
        }

        Err(PortError::Exhausted {
            purpose,
            start: base,
            end,
        })
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// A reserved port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    purpose: PortPurpose,
    leased: Option<Leased>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn purpose(&self) -> PortPurpose {
        self.purpose
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(leased) = self.leased.take() {
            leased
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.port);
            debug!(port = self.port, purpose = %self.purpose, "port released");
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
