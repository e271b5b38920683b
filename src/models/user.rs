use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use super::ItemId;

/// Identifier of a Twittix account
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relationship between the requesting user and an author
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    /// Mutual follow
    Friend,
    /// One-way follow
    Followed,
    None,
}

/// The requesting user together with the signals loaded for this request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Authors this user follows
    #[serde(default)]
    pub follows: HashSet<UserId>,
    /// Authors with a mutual follow relationship
    #[serde(default)]
    pub friends: HashSet<UserId>,
    #[serde(default)]
    pub blocked_authors: HashSet<UserId>,
    /// Items already viewed by this user
    #[serde(default)]
    pub seen: HashSet<ItemId>,
    /// Number of likes this user gave to each author
    #[serde(default)]
    pub author_interactions: HashMap<UserId, u32>,
}

impl User {
    /// Creates a user with no signals
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn relationship_with(&self, author: UserId) -> Relationship {
        if self.friends.contains(&author) {
            Relationship::Friend
        } else if self.follows.contains(&author) {
            Relationship::Followed
        } else {
            Relationship::None
        }
    }

    pub fn interactions_with(&self, author: UserId) -> u32 {
        self.author_interactions.get(&author).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friend_takes_precedence_over_follow() {
        let mut user = User::new(UserId(1));
        user.follows.insert(UserId(2));
        user.follows.insert(UserId(3));
        user.friends.insert(UserId(3));

        assert_eq!(user.relationship_with(UserId(2)), Relationship::Followed);
        assert_eq!(user.relationship_with(UserId(3)), Relationship::Friend);
        assert_eq!(user.relationship_with(UserId(4)), Relationship::None);
    }

    #[test]
    fn test_missing_interactions_default_to_zero() {
        let mut user = User::new(UserId(1));
        user.author_interactions.insert(UserId(9), 4);

        assert_eq!(user.interactions_with(UserId(9)), 4);
        assert_eq!(user.interactions_with(UserId(10)), 0);
    }
}
