//! Work package lanes and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle lane of a work package (features reuse the same lanes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    #[default]
    Planned,
    Claimed,
    #[serde(alias = "in_progress")]
    Doing,
    ForReview,
    Done,
    Blocked,
    Canceled,
}

impl Lane {
    pub const ALL: [Lane; 7] = [
        Lane::Planned,
        Lane::Claimed,
        Lane::Doing,
        Lane::ForReview,
        Lane::Done,
        Lane::Blocked,
        Lane::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Claimed => "claimed",
            Self::Doing => "doing",
            Self::ForReview => "for_review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal lanes have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }

    /// Lanes reachable in one step from `self`.
    pub fn successors(&self) -> &'static [Lane] {
        match self {
            Self::Planned => &[Lane::Claimed, Lane::Doing, Lane::Blocked, Lane::Canceled],
            Self::Claimed => &[Lane::Planned, Lane::Doing, Lane::Blocked, Lane::Canceled],
            Self::Doing => &[
                Lane::Planned,
                Lane::ForReview,
                Lane::Blocked,
                Lane::Canceled,
            ],
            Self::ForReview => &[Lane::Doing, Lane::Done, Lane::Blocked, Lane::Canceled],
            Self::Blocked => &[Lane::Planned, Lane::Claimed, Lane::Doing, Lane::Canceled],
            Self::Done | Self::Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, target: Lane) -> bool {
        self.successors().contains(&target)
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in_progress" => Ok(Self::Doing),
            other => Self::ALL
                .into_iter()
                .find(|lane| lane.as_str() == other)
                .ok_or_else(|| format!("unknown lane '{}'", other)),
        }
    }
}
