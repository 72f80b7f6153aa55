#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteAction {
    Created,
    Updated,
    Removed,
}

impl VoteAction {
    /// Transition of the (user, comment) vote state machine
    ///
    /// Returns the action to take and the resulting vote, given the current vote and the
    /// polarity the user just voted with.
    pub fn transition(current: Option<bool>, is_like: bool) -> (VoteAction, Option<bool>) {
        match current {
            None => (VoteAction::Created, Some(is_like)),
            Some(p) if p == is_like => (VoteAction::Removed, None),
            Some(_) => (VoteAction::Updated, Some(is_like)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VoteCounts {
    pub likes: u64,
    pub dislikes: u64,
    pub total: u64,
}

impl VoteCounts {
    pub fn new(likes: u64, dislikes: u64) -> VoteCounts {
        VoteCounts {
            likes,
            dislikes,
            total: likes + dislikes,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResult {
    pub action: VoteAction,

    /// Vote of the user after this action, `None` if it was removed
    pub vote: Option<bool>,

    pub vote_counts: VoteCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        use VoteAction::*;
        assert_eq!(VoteAction::transition(None, true), (Created, Some(true)));
        assert_eq!(VoteAction::transition(None, false), (Created, Some(false)));
        assert_eq!(VoteAction::transition(Some(true), true), (Removed, None));
        assert_eq!(VoteAction::transition(Some(true), false), (Updated, Some(false)));
        assert_eq!(VoteAction::transition(Some(false), false), (Removed, None));
        assert_eq!(VoteAction::transition(Some(false), true), (Updated, Some(true)));
    }

    #[test]
    fn total_is_sum() {
        assert_eq!(VoteCounts::new(3, 2).total, 5);
    }
}
