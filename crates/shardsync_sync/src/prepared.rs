//! # Prepared Groups
//!
//! Content-independent replies built once at startup as cached groups.
//! They are compressed on their first send and reused forever after.

use shardsync_core::SanityResult;
use shardsync_net::{GroupMode, PacketGroup, PacketGroupPool, PacketSink};

use crate::packets::{SetFacet, SetWarMode};
use crate::world::FACET_COUNT;

/// Cached war mode and facet change groups.
#[derive(Debug)]
pub struct PreparedGroups {
    war_mode: [PacketGroup; 2],
    facets: Vec<PacketGroup>,
}

impl PreparedGroups {
    /// Builds every prepared group from `groups`.
    ///
    /// # Errors
    ///
    /// Returns a sanity violation if a group cannot be built.
    pub fn new(groups: &PacketGroupPool) -> SanityResult<Self> {
        let war_mode = [
            groups.with_packet(GroupMode::Cached, &SetWarMode(false))?,
            groups.with_packet(GroupMode::Cached, &SetWarMode(true))?,
        ];
        let mut facets = Vec::with_capacity(FACET_COUNT);
        for facet in 0..FACET_COUNT {
            let facet = u8::try_from(facet).unwrap_or(u8::MAX);
            facets.push(groups.with_packet(GroupMode::Cached, &SetFacet(facet))?);
        }
        Ok(Self { war_mode, facets })
    }

    /// The war mode toggle group.
    #[inline]
    #[must_use]
    pub fn war_mode(&self, enabled: bool) -> &PacketGroup {
        &self.war_mode[usize::from(enabled)]
    }

    /// The facet change group, if the client knows `facet`.
    #[must_use]
    pub fn facet_change(&self, facet: u8) -> Option<&PacketGroup> {
        let group = self.facets.get(usize::from(facet));
        if group.is_none() {
            tracing::warn!(facet, "no prepared group for facet");
        }
        group
    }

    /// Sends the war mode toggle.
    pub fn send_war_mode(&self, sink: &dyn PacketSink, enabled: bool) {
        sink.send_packet_group(self.war_mode(enabled));
    }

    /// Sends the facet change, ignoring facets the client does not know.
    pub fn send_facet_change(&self, sink: &dyn PacketSink, facet: u8) {
        if let Some(group) = self.facet_change(facet) {
            sink.send_packet_group(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use shardsync_net::{Compressor, Lz4Compressor, OutgoingPacket};

    #[derive(Default)]
    struct Wire(Mutex<Vec<Vec<u8>>>);

    impl PacketSink for Wire {
        fn send_packet_group(&self, group: &PacketGroup) {
            let lz4: &dyn Compressor = &Lz4Compressor;
            let ticket = group.begin_send().unwrap();
            let bytes = ticket.group().with_final_bytes(Some(lz4), <[u8]>::to_vec).unwrap();
            self.0.lock().push(bytes);
        }

        fn send_single_packet(&self, _packet: &dyn OutgoingPacket) {}
    }

    #[test]
    fn test_cached_groups_compress_once() {
        let prepared = PreparedGroups::new(&PacketGroupPool::default()).unwrap();
        let wire = Wire::default();
        for _ in 0..5 {
            prepared.send_war_mode(&wire, true);
        }
        prepared.send_facet_change(&wire, 2);
        prepared.send_facet_change(&wire, 200);

        let sent = wire.0.lock();
        assert_eq!(sent.len(), 6);
        assert!(sent[..5].windows(2).all(|w| w[0] == w[1]));
        assert_eq!(prepared.war_mode[1].compression_passes(), 1);
        assert_eq!(prepared.war_mode[0].compression_passes(), 0);
        assert!(!prepared.war_mode[1].is_disposed());
    }
}
