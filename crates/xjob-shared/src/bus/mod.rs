//! # Message Bus
//!
//! Provider abstraction over the FIFO queue service the engine dispatches
//! through. Two providers behind one enum, no trait objects: `Beanstalk`
//! opens real TCP connections, `Memory` shares a process-local registry.
//! Senders and listeners are connection-shaped because the underlying
//! protocol is: a sender is bound to one (endpoint, tube), a listener
//! watches one tube.

use std::sync::Arc;
use std::time::Duration;

pub mod beanstalk;
pub mod memory;
pub mod messages;

use beanstalk::{BeanstalkConnection, PutOutcome};
use memory::MemoryBus;

use crate::errors::XjobResult;

/// Messaging backend selector
#[derive(Debug, Clone)]
pub enum BusProvider {
    /// Real beanstalkd endpoints over TCP
    Beanstalk,
    /// Process-local bus for tests and development
    Memory(Arc<MemoryBus>),
}

impl BusProvider {
    /// Create an in-memory provider with its own registry
    pub fn new_in_memory() -> Self {
        Self::Memory(Arc::new(MemoryBus::new()))
    }

    /// Provider name for logging
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Beanstalk => "beanstalkd",
            Self::Memory(_) => "in_memory",
        }
    }

    /// List the tubes existing on an endpoint.
    pub async fn tubes(&self, addr: &str) -> XjobResult<Vec<String>> {
        match self {
            Self::Beanstalk => {
                let mut conn = BeanstalkConnection::connect(addr).await?;
                conn.list_tubes().await
            }
            Self::Memory(bus) => bus.tubes(addr),
        }
    }

    /// Open a sender bound to one (endpoint, tube).
    pub async fn sender(&self, addr: &str, tube: &str) -> XjobResult<BusSender> {
        match self {
            Self::Beanstalk => {
                let mut conn = BeanstalkConnection::connect(addr).await?;
                conn.use_tube(tube).await?;
                Ok(BusSender::Beanstalk {
                    conn,
                    tube: tube.to_string(),
                })
            }
            Self::Memory(bus) => Ok(BusSender::Memory {
                bus: bus.clone(),
                addr: addr.to_string(),
                tube: tube.to_string(),
            }),
        }
    }

    /// Open a listener watching one (endpoint, tube).
    pub async fn listener(&self, addr: &str, tube: &str) -> XjobResult<BusListener> {
        match self {
            Self::Beanstalk => {
                let mut conn = BeanstalkConnection::connect(addr).await?;
                conn.watch(tube).await?;
                Ok(BusListener::Beanstalk { conn })
            }
            Self::Memory(bus) => {
                bus.register(addr, &[tube]);
                Ok(BusListener::Memory {
                    bus: bus.clone(),
                    addr: addr.to_string(),
                    tube: tube.to_string(),
                })
            }
        }
    }
}

/// Sending half of a bus connection
#[derive(Debug)]
pub enum BusSender {
    Beanstalk {
        conn: BeanstalkConnection,
        tube: String,
    },
    Memory {
        bus: Arc<MemoryBus>,
        addr: String,
        tube: String,
    },
}

impl BusSender {
    pub fn addr(&self) -> &str {
        match self {
            Self::Beanstalk { conn, .. } => conn.addr(),
            Self::Memory { addr, .. } => addr,
        }
    }

    pub fn tube(&self) -> &str {
        match self {
            Self::Beanstalk { tube, .. } => tube,
            Self::Memory { tube, .. } => tube,
        }
    }

    /// Enqueue one message. `Ok(false)` means the endpoint is full and the
    /// caller should pick another one.
    pub async fn try_put(&mut self, payload: &[u8]) -> XjobResult<bool> {
        match self {
            Self::Beanstalk { conn, .. } => match conn.put(payload).await? {
                PutOutcome::Inserted(_) => Ok(true),
                PutOutcome::Full => Ok(false),
            },
            Self::Memory { bus, addr, tube } => bus.try_put(addr, tube, payload),
        }
    }
}

/// One job handed out by `BusListener::reserve`
#[derive(Debug, Clone)]
pub struct BusJob {
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Consuming half of a bus connection
#[derive(Debug)]
pub enum BusListener {
    Beanstalk {
        conn: BeanstalkConnection,
    },
    Memory {
        bus: Arc<MemoryBus>,
        addr: String,
        tube: String,
    },
}

impl BusListener {
    /// Reserve the next job, waiting at most `timeout`.
    pub async fn reserve(&mut self, timeout: Duration) -> XjobResult<Option<BusJob>> {
        let job = match self {
            Self::Beanstalk { conn } => {
                conn.reserve_with_timeout(timeout.as_secs().max(1)).await?
            }
            Self::Memory { bus, addr, tube } => bus.reserve(addr, tube, timeout).await?,
        };
        Ok(job.map(|(id, payload)| BusJob { id, payload }))
    }

    /// Acknowledge a reserved job.
    pub async fn delete(&mut self, id: u64) -> XjobResult<()> {
        match self {
            Self::Beanstalk { conn } => conn.delete(id).await,
            Self::Memory { bus, addr, tube } => bus.delete(addr, tube, id),
        }
    }

    /// Shelve a reserved job for operator inspection.
    pub async fn bury(&mut self, id: u64) -> XjobResult<()> {
        match self {
            Self::Beanstalk { conn } => conn.bury(id).await,
            Self::Memory { bus, addr, tube } => bus.bury(addr, tube, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provider_round_trip() {
        let provider = BusProvider::new_in_memory();
        let mut listener = provider.listener("w1:11300", "work").await.unwrap();
        let mut sender = provider.sender("w1:11300", "work").await.unwrap();

        assert!(sender.try_put(b"payload").await.unwrap());
        let job = listener
            .reserve(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, b"payload");
        listener.delete(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_provider_tubes_visible_after_listen() {
        let provider = BusProvider::new_in_memory();
        provider.listener("w1:11300", "xjob-work").await.unwrap();
        let tubes = provider.tubes("w1:11300").await.unwrap();
        assert!(tubes.contains(&"xjob-work".to_string()));
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(BusProvider::Beanstalk.provider_name(), "beanstalkd");
        assert_eq!(BusProvider::new_in_memory().provider_name(), "in_memory");
    }
}
