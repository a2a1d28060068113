//! The two shared-memory data channels a host may have attached.

use std::sync::{Arc, PoisonError, RwLock};

use crate::ring::RingBuffer;

/// Which data channel a ring serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Low-latency output for the renderer. Full rings trigger backpressure.
    Visual,
    /// Best-effort copy of output for analysis. Full rings drop frames.
    Analysis,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Visual => "visual",
            Channel::Analysis => "analysis",
        }
    }
}

/// Rings currently attached to the host, replaceable at runtime.
#[derive(Default)]
pub struct DataChannels {
    visual: RwLock<Option<Arc<RingBuffer>>>,
    analysis: RwLock<Option<Arc<RingBuffer>>>,
}

impl DataChannels {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, channel: Channel) -> &RwLock<Option<Arc<RingBuffer>>> {
        match channel {
            Channel::Visual => &self.visual,
            Channel::Analysis => &self.analysis,
        }
    }

    /// Attach a ring, replacing any previous one for that channel.
    pub fn attach(&self, channel: Channel, ring: RingBuffer) -> Arc<RingBuffer> {
        let ring = Arc::new(ring);
        let mut slot = self
            .slot(channel)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::clone(&ring));
        log::info!(
            "{} channel attached ({} bytes)",
            channel.as_str(),
            ring.capacity()
        );
        ring
    }

    /// Drop the ring for a channel. Returns `true` if one was attached.
    pub fn detach(&self, channel: Channel) -> bool {
        let mut slot = self
            .slot(channel)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let had = slot.take().is_some();
        if had {
            log::info!("{} channel detached", channel.as_str());
        }
        had
    }

    /// The usable ring for a channel: attached and not flagged detached by
    /// its consumer.
    pub fn get(&self, channel: Channel) -> Option<Arc<RingBuffer>> {
        self.slot(channel)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|ring| !ring.is_detached())
            .cloned()
    }

    /// Whether `ring` is still the usable ring for `channel`.
    pub fn is_current(&self, channel: Channel, ring: &Arc<RingBuffer>) -> bool {
        self.get(channel)
            .is_some_and(|current| Arc::ptr_eq(&current, ring))
    }

    /// Fill level of a channel's ring, if usable.
    pub fn utilization(&self, channel: Channel) -> Option<f64> {
        self.get(channel).map(|ring| ring.utilization())
    }
}
