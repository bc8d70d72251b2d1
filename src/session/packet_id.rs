//! Packet identifier allocation
//!
//! [MQTT-2.3.1-2] each new QoS > 0 PUBLISH, SUBSCRIBE or UNSUBSCRIBE carries a
//! currently unused, non-zero identifier.

use ahash::AHashSet;

use crate::protocol::ProtocolError;

/// Hands out packet identifiers 1..=65535, wrapping to 1, skipping ids in use
#[derive(Debug)]
pub struct PacketIdAllocator {
    /// Next ID to try allocating
    next_id: u16,
    in_use: AHashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: AHashSet::new(),
        }
    }

    /// Allocate the next free identifier
    ///
    /// Fails with `ResourceExhausted` when all 65535 identifiers are in flight.
    pub fn allocate(&mut self) -> Result<u16, ProtocolError> {
        if self.in_use.len() >= u16::MAX as usize {
            return Err(ProtocolError::ResourceExhausted(
                "all packet identifiers in use",
            ));
        }

        // At least one id is free, so this terminates within one lap
        while self.in_use.contains(&self.next_id) {
            self.advance_next();
        }

        let id = self.next_id;
        self.in_use.insert(id);
        self.advance_next();
        Ok(id)
    }

    /// Release an identifier once its flow has completed
    pub fn release(&mut self, id: u16) -> bool {
        self.in_use.remove(&id)
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }

    /// Advance next_id, skipping 0
    fn advance_next(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}
