//! Allow-list and blacklist of user ids, fixed at startup.

use std::collections::HashSet;

/// Why a user was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Denial {
    NotAllowed,
    Blacklisted,
}

impl Denial {
    pub fn message(self) -> &'static str {
        match self {
            Self::NotAllowed => "user not allowed",
            Self::Blacklisted => "user in blacklist",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccessList {
    allowed: HashSet<String>,
    blocked: HashSet<String>,
}

impl AccessList {
    /// Empty entries are dropped from both lists.
    pub fn new<A, B>(allowed: A, blocked: B) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            allowed: to_set(allowed),
            blocked: to_set(blocked),
        }
    }

    /// A user must be allow-listed and not blacklisted; the blacklist wins
    /// when a user is on both.
    pub fn check(&self, user_id: &str) -> Result<(), Denial> {
        if !self.allowed.contains(user_id) {
            return Err(Denial::NotAllowed);
        }
        if self.blocked.contains(user_id) {
            return Err(Denial::Blacklisted);
        }
        Ok(())
    }
}

fn to_set<I>(values: I) -> HashSet<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    values
        .into_iter()
        .map(Into::into)
        .filter(|v| !v.is_empty())
        .collect()
}
