// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracking of who is currently typing in a dialog.

use std::collections::BTreeSet;

use wrencommon::identifiers::UserId;
use wrencoreclient::store::TypingEvent;

/// The set of users typing in one dialog.
///
/// The feed gives no ordering guarantee, so the set is last-write-wins per
/// user: the most recent signal for a user decides whether they are in the
/// set. The set is ephemeral screen state and is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSet {
    users: BTreeSet<UserId>,
}

impl TypingSet {
    /// Applies a typing signal. Returns whether the set changed.
    pub fn apply(&mut self, event: &TypingEvent) -> bool {
        if event.is_typing {
            self.users.insert(event.user_id)
        } else {
            self.users.remove(&event.user_id)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.users.contains(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.users.iter()
    }
}

#[cfg(test)]
mod tests {
    use wrencommon::identifiers::DialogId;

    use super::*;

    fn event(user_id: UserId, is_typing: bool) -> TypingEvent {
        TypingEvent {
            dialog_id: DialogId::random(),
            user_id,
            is_typing,
        }
    }

    #[test]
    fn last_write_wins_per_user() {
        let mut set = TypingSet::default();
        let alice = UserId::random();
        let bob = UserId::random();

        assert!(set.apply(&event(alice, true)));
        // a repeated signal does not change the set
        assert!(!set.apply(&event(alice, true)));
        assert!(set.apply(&event(bob, true)));
        assert!(set.contains(&alice) && set.contains(&bob));

        assert!(set.apply(&event(alice, false)));
        assert!(!set.contains(&alice));
        assert!(set.contains(&bob));

        // stop for a user who never typed is a no-op
        assert!(!set.apply(&event(UserId::random(), false)));
    }
}
