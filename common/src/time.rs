// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use chrono::Duration;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TimeStamp {
    time: DateTime<Utc>,
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl From<TimeStamp> for DateTime<Utc> {
    fn from(time_stamp: TimeStamp) -> Self {
        time_stamp.time
    }
}

impl Deref for TimeStamp {
    type Target = DateTime<Utc>;

    fn deref(&self) -> &Self::Target {
        &self.time
    }
}

impl TimeStamp {
    pub fn now() -> Self {
        let time = Utc::now();
        Self { time }
    }

    pub fn is_more_recent_than(&self, other: &Self) -> bool {
        self.time > other.time
    }

    pub fn is_between(&self, start: &Self, end: &Self) -> bool {
        self.time >= start.time && self.time <= end.time
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_wall_clock() {
        let earlier = TimeStamp::now();
        let later: TimeStamp = (earlier.time() + Duration::milliseconds(5)).into();
        assert!(later.is_more_recent_than(&earlier));
        assert!(!earlier.is_more_recent_than(&later));
        assert!(earlier.is_between(&earlier, &later));
    }
}
