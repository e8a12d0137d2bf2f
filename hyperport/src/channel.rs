/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The shared state of two entangled ports.
//!
//! A [`Channel`] is only ever touched by the registry's home thread, so
//! nothing here is synchronized. Each operation names a side by one of the
//! channel's two port identifiers; naming any other identifier is a logic
//! error and panics.

use std::collections::VecDeque;
use std::mem;

use crate::identifier::Locality;
use crate::identifier::PortIdentifier;
use crate::message::MessageWithPorts;

/// One message channel: two sides, each with its own pending queue, closed
/// flag, and owning locality.
#[derive(Debug)]
pub(crate) struct Channel {
    ports: [PortIdentifier; 2],
    closed: [bool; 2],
    owners: [Option<Locality>; 2],
    pending: [VecDeque<MessageWithPorts>; 2],
    /// Batches taken by `take_all_messages_for_port` whose delivery has not
    /// yet completed.
    in_flight_batches: u64,
}

impl Channel {
    pub(crate) fn new(port1: PortIdentifier, port2: PortIdentifier) -> Self {
        assert_ne!(port1, port2, "a channel needs two distinct ports");
        Self {
            ports: [port1, port2],
            closed: [false; 2],
            owners: [None; 2],
            pending: [VecDeque::new(), VecDeque::new()],
            in_flight_batches: 0,
        }
    }

    fn side(&self, id: &PortIdentifier) -> usize {
        if *id == self.ports[0] {
            0
        } else if *id == self.ports[1] {
            1
        } else {
            panic!(
                "port {} does not belong to channel ({}, {})",
                id, self.ports[0], self.ports[1]
            );
        }
    }

    pub(crate) fn ports(&self) -> &[PortIdentifier; 2] {
        &self.ports
    }

    /// The identifier on the other side of `id`.
    pub(crate) fn sibling(&self, id: &PortIdentifier) -> PortIdentifier {
        self.ports[1 - self.side(id)]
    }

    /// Record that `id` is now owned by `locality`. Re-entangling a side
    /// that is already owned by a different locality is a logic error.
    pub(crate) fn entangle_port_with_locality(&mut self, id: &PortIdentifier, locality: Locality) {
        let side = self.side(id);
        if let Some(previous) = self.owners[side] {
            assert_eq!(
                previous, locality,
                "port {} re-entangled with {} while owned by {}",
                id, locality, previous
            );
        }
        self.owners[side] = Some(locality);
    }

    /// Forget the owner of `id`. Its pending queue is retained so that the
    /// port's next owner receives the messages.
    pub(crate) fn disentangle_port(&mut self, id: &PortIdentifier) {
        let side = self.side(id);
        self.owners[side] = None;
    }

    /// Close one side, returning the messages that were still pending for
    /// it. The other side is unaffected.
    pub(crate) fn close_port(&mut self, id: &PortIdentifier) -> Vec<MessageWithPorts> {
        let side = self.side(id);
        self.closed[side] = true;
        self.owners[side] = None;
        mem::take(&mut self.pending[side]).into()
    }

    /// Enqueue `message` for `remote_target`. Returns true when the queue
    /// was empty, i.e. the target must be notified; later messages coalesce
    /// into that one notification because the target drains its whole queue.
    ///
    /// A message for a closed side cannot be delivered and is handed back.
    pub(crate) fn post_message_to_remote(
        &mut self,
        message: MessageWithPorts,
        remote_target: &PortIdentifier,
    ) -> Result<bool, MessageWithPorts> {
        let side = self.side(remote_target);
        if self.closed[side] {
            return Err(message);
        }
        self.pending[side].push_back(message);
        Ok(self.pending[side].len() == 1)
    }

    /// Swap out every pending message for `id`, starting a delivery batch.
    /// The caller must call [`Channel::batch_delivered`] once the batch has
    /// been dispatched.
    pub(crate) fn take_all_messages_for_port(
        &mut self,
        id: &PortIdentifier,
    ) -> Vec<MessageWithPorts> {
        let side = self.side(id);
        self.in_flight_batches += 1;
        mem::take(&mut self.pending[side]).into()
    }

    pub(crate) fn batch_delivered(&mut self) {
        assert!(self.in_flight_batches > 0, "batch completed twice");
        self.in_flight_batches -= 1;
    }

    /// Pop the oldest pending message for `id`.
    pub(crate) fn try_take_message_for_port(
        &mut self,
        id: &PortIdentifier,
    ) -> Option<MessageWithPorts> {
        let side = self.side(id);
        self.pending[side].pop_front()
    }

    pub(crate) fn pending_len(&self, id: &PortIdentifier) -> usize {
        self.pending[self.side(id)].len()
    }

    pub(crate) fn is_port_closed(&self, id: &PortIdentifier) -> bool {
        self.closed[self.side(id)]
    }

    #[cfg(test)]
    pub(crate) fn owner(&self, id: &PortIdentifier) -> Option<Locality> {
        self.owners[self.side(id)]
    }

    #[cfg(test)]
    pub(crate) fn in_flight_batches(&self) -> u64 {
        self.in_flight_batches
    }

    /// Both sides are closed and no delivery is outstanding; the channel may
    /// be discarded.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.closed[0] && self.closed[1] && self.in_flight_batches == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn ids() -> (PortIdentifier, PortIdentifier) {
        (
            PortIdentifier::generate(Locality(1)),
            PortIdentifier::generate(Locality(1)),
        )
    }

    fn message(text: &str) -> MessageWithPorts {
        MessageWithPorts::new(Payload::new(text.as_bytes().to_vec()))
    }

    fn texts(messages: Vec<MessageWithPorts>) -> Vec<String> {
        messages
            .into_iter()
            .map(|m| String::from_utf8(m.payload.as_bytes().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_post_coalesces_notifications() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);

        assert!(channel.post_message_to_remote(message("1"), &b).unwrap());
        assert!(!channel.post_message_to_remote(message("2"), &b).unwrap());
        assert!(!channel.post_message_to_remote(message("3"), &b).unwrap());
        assert_eq!(channel.pending_len(&b), 3);
        assert_eq!(channel.pending_len(&a), 0);

        assert_eq!(texts(channel.take_all_messages_for_port(&b)), vec!["1", "2", "3"]);
        // Queue drained: the next message must notify again.
        assert!(channel.post_message_to_remote(message("4"), &b).unwrap());
    }

    #[test]
    fn test_in_flight_batches() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);
        channel.post_message_to_remote(message("x"), &a).unwrap();

        let batch = channel.take_all_messages_for_port(&a);
        assert_eq!(batch.len(), 1);
        assert_eq!(channel.in_flight_batches(), 1);

        channel.close_port(&a);
        channel.close_port(&b);
        assert!(!channel.is_reclaimable());

        channel.batch_delivered();
        assert!(channel.is_reclaimable());
    }

    #[test]
    fn test_try_take_is_fifo() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);
        for text in ["1", "2"] {
            channel.post_message_to_remote(message(text), &a).unwrap();
        }
        let first = channel.try_take_message_for_port(&a).unwrap();
        assert_eq!(first.payload.as_bytes(), b"1");
        let second = channel.try_take_message_for_port(&a).unwrap();
        assert_eq!(second.payload.as_bytes(), b"2");
        assert!(channel.try_take_message_for_port(&a).is_none());
    }

    #[test]
    fn test_disentangle_keeps_queue() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);
        channel.entangle_port_with_locality(&b, Locality(1));
        channel.post_message_to_remote(message("kept"), &b).unwrap();

        channel.disentangle_port(&b);
        assert_eq!(channel.owner(&b), None);
        assert_eq!(channel.pending_len(&b), 1);

        channel.entangle_port_with_locality(&b, Locality(2));
        assert_eq!(channel.owner(&b), Some(Locality(2)));
        assert_eq!(texts(channel.take_all_messages_for_port(&b)), vec!["kept"]);
    }

    #[test]
    fn test_close_clears_one_side() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);
        channel.post_message_to_remote(message("to-a"), &a).unwrap();
        channel.post_message_to_remote(message("to-b"), &b).unwrap();

        assert_eq!(texts(channel.close_port(&b)), vec!["to-b"]);
        assert!(channel.is_port_closed(&b));
        assert!(!channel.is_port_closed(&a));
        assert_eq!(channel.pending_len(&a), 1);

        // Messages to a closed side are handed back.
        assert!(channel.post_message_to_remote(message("late"), &b).is_err());
        // Closing twice is harmless.
        assert!(channel.close_port(&b).is_empty());
    }

    #[test]
    fn test_sibling() {
        let (a, b) = ids();
        let channel = Channel::new(a, b);
        assert_eq!(channel.sibling(&a), b);
        assert_eq!(channel.sibling(&b), a);
        assert_eq!(channel.ports(), &[a, b]);
    }

    #[test]
    #[should_panic(expected = "re-entangled")]
    fn test_reentangle_with_other_locality_panics() {
        let (a, b) = ids();
        let mut channel = Channel::new(a, b);
        channel.entangle_port_with_locality(&a, Locality(1));
        channel.entangle_port_with_locality(&a, Locality(2));
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_foreign_port_panics() {
        let (a, b) = ids();
        let (c, _) = ids();
        let channel = Channel::new(a, b);
        channel.pending_len(&c);
    }
}
