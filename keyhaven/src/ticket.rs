// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{GroupSessionMessage, SessionId};

/// One epoch of a group session together with the members valid as of that epoch.
///
/// Participants are a full membership snapshot, not a change relative to earlier epochs. Tickets
/// are equal when they describe the same epoch of the same session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ticket {
    pub(crate) group_session_message: GroupSessionMessage,
    pub(crate) participants: BTreeSet<String>,
}

impl Ticket {
    pub fn new(group_session_message: GroupSessionMessage, participants: BTreeSet<String>) -> Self {
        Self {
            group_session_message,
            participants,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.group_session_message.session_id
    }

    pub fn epoch_number(&self) -> u32 {
        self.group_session_message.epoch_number
    }

    pub fn group_session_message(&self) -> &GroupSessionMessage {
        &self.group_session_message
    }

    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id() && self.epoch_number() == other.epoch_number()
    }
}

impl Eq for Ticket {}
