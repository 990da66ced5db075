// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{ids::CellId, messages::CellRequest};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// One message as it sits in an outbox: the payload plus its FIFO slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub message_id: u64,
    pub request: CellRequest,
}

/// Reliable FIFO from this master to one cell. Messages stay queued and
/// are redelivered until acknowledged; the queue itself is part of the
/// persisted catalog state, so a master restart redelivers rather than
/// forgets.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Mailbox {
    next_message_id: u64,
    outbox: VecDeque<OutboxMessage>,
}

impl Mailbox {
    pub fn push(&mut self, request: CellRequest) -> u64 {
        self.next_message_id += 1;
        let message_id = self.next_message_id;
        self.outbox.push_back(OutboxMessage {
            message_id,
            request,
        });
        message_id
    }

    /// Everything not yet acknowledged, in FIFO order.
    pub fn pending(&self) -> impl Iterator<Item = &OutboxMessage> {
        self.outbox.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.outbox.len()
    }

    /// Drops every message with id at or below `up_to`.
    pub fn acknowledge(&mut self, up_to: u64) {
        while self
            .outbox
            .front()
            .is_some_and(|m| m.message_id <= up_to)
        {
            self.outbox.pop_front();
        }
    }
}

/// The master's outboxes, keyed by destination cell.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MailboxRegistry {
    mailboxes: std::collections::BTreeMap<CellId, Mailbox>,
}

impl MailboxRegistry {
    pub fn post(&mut self, cell: CellId, request: CellRequest) {
        let mailbox = self.mailboxes.entry(cell).or_default();
        let message_id = mailbox.push(request);
        debug!(%cell, message_id, "message posted to cell mailbox");
    }

    pub fn mailbox(&self, cell: CellId) -> Option<&Mailbox> {
        self.mailboxes.get(&cell)
    }

    pub fn acknowledge(&mut self, cell: CellId, up_to: u64) {
        if let Some(mailbox) = self.mailboxes.get_mut(&cell) {
            mailbox.acknowledge(up_to);
        }
    }

    /// Drains and returns the pending messages of one cell, acknowledging
    /// them in the same breath. Test cells use this as their delivery
    /// pump; production transports acknowledge explicitly.
    pub fn take_pending(&mut self, cell: CellId) -> Vec<OutboxMessage> {
        let Some(mailbox) = self.mailboxes.get_mut(&cell) else {
            return Vec::new();
        };
        let messages: Vec<OutboxMessage> = mailbox.pending().cloned().collect();
        if let Some(last) = messages.last() {
            mailbox.acknowledge(last.message_id);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TabletId;

    fn freeze(tablet: u64) -> CellRequest {
        CellRequest::FreezeTablet {
            tablet_id: TabletId(tablet),
            mount_revision: 1,
        }
    }

    #[test]
    fn fifo_and_redelivery() {
        let mut mailbox = Mailbox::default();
        let first = mailbox.push(freeze(1));
        let second = mailbox.push(freeze(2));
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // Unacknowledged messages stay visible in order.
        let ids: Vec<u64> = mailbox.pending().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2]);
        let ids: Vec<u64> = mailbox.pending().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2]);

        mailbox.acknowledge(1);
        let ids: Vec<u64> = mailbox.pending().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![2]);
        mailbox.acknowledge(2);
        assert_eq!(mailbox.pending_count(), 0);
    }
}
