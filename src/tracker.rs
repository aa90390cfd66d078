//! Per-user invite accounting: running counts toward the reward threshold,
//! the lifetime leaderboard, the registry of everyone who ever talked to the
//! bot, and the set of users currently holding an unclaimed reward.
//!
//! The running count resets to zero at the moment it crosses the threshold,
//! not when the reward is claimed, so a user keeps accumulating toward the
//! next reward while one is outstanding. The leaderboard count never resets.

use crate::store::DocumentStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const DOC_USERS: &str = "bot_users";
pub const DOC_ELIGIBLE: &str = "eligible_users";
pub const DOC_COUNTS: &str = "user_add_counts";
pub const DOC_LEADERBOARD: &str = "leaderboard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderEntry {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InviteOutcome {
    /// Running count after the increment, before any threshold reset.
    pub count: u32,
    pub became_eligible: bool,
}

pub struct ProgressTracker {
    store: Arc<DocumentStore>,
    threshold: u32,
}

impl ProgressTracker {
    pub fn new(store: Arc<DocumentStore>, threshold: u32) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn register_user(&self, user_id: u64) -> Result<()> {
        self.store
            .update::<BTreeSet<u64>, _, _>(DOC_USERS, |users| {
                users.insert(user_id);
            })
            .await?;
        Ok(())
    }

    /// Credits `added` invites to `inviter`. Updates the registry, the
    /// leaderboard (latest-seen display name wins) and the running count in
    /// one pass; crossing the threshold grants eligibility and resets the
    /// running count in the same update.
    pub async fn record_invites(
        &self,
        inviter: u64,
        display_name: &str,
        added: u32,
    ) -> Result<InviteOutcome> {
        self.register_user(inviter).await?;

        let name = display_name.to_string();
        self.store
            .update::<HashMap<String, LeaderEntry>, _, _>(DOC_LEADERBOARD, move |board| {
                let entry = board
                    .entry(inviter.to_string())
                    .or_insert_with(|| LeaderEntry {
                        name: name.clone(),
                        count: 0,
                    });
                entry.name = name;
                entry.count += added as u64;
            })
            .await?;

        let threshold = self.threshold;
        let (count, crossed) = self
            .store
            .update::<HashMap<String, u32>, _, _>(DOC_COUNTS, move |counts| {
                let c = counts.entry(inviter.to_string()).or_insert(0);
                *c += added;
                let after = *c;
                let crossed = after >= threshold;
                if crossed {
                    *c = 0;
                }
                (after, crossed)
            })
            .await?;

        if crossed {
            self.store
                .update::<BTreeSet<u64>, _, _>(DOC_ELIGIBLE, |set| {
                    set.insert(inviter);
                })
                .await?;
        }

        Ok(InviteOutcome {
            count,
            became_eligible: crossed,
        })
    }

    /// Running count toward the next reward; unknown users read as 0.
    pub fn progress(&self, user_id: u64) -> u32 {
        let counts: HashMap<String, u32> = self.store.load(DOC_COUNTS);
        counts.get(&user_id.to_string()).copied().unwrap_or(0)
    }

    /// Top `n` leaderboard entries by lifetime count, descending. Ties are in
    /// unspecified order.
    pub fn top(&self, n: usize) -> Vec<(u64, LeaderEntry)> {
        let board: HashMap<String, LeaderEntry> = self.store.load(DOC_LEADERBOARD);
        let mut entries: Vec<(u64, LeaderEntry)> = board
            .into_iter()
            .filter_map(|(id, entry)| id.parse::<u64>().ok().map(|id| (id, entry)))
            .collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        entries.truncate(n);
        entries
    }

    pub fn leaderboard_entry(&self, user_id: u64) -> Option<LeaderEntry> {
        let board: HashMap<String, LeaderEntry> = self.store.load(DOC_LEADERBOARD);
        board.get(&user_id.to_string()).cloned()
    }

    pub fn is_eligible(&self, user_id: u64) -> bool {
        let set: BTreeSet<u64> = self.store.load(DOC_ELIGIBLE);
        set.contains(&user_id)
    }

    /// Removes the user's unclaimed reward. Removing an absent member is a
    /// no-op, so calling this twice is the same as calling it once.
    pub async fn consume_eligibility(&self, user_id: u64) -> Result<()> {
        self.store
            .update::<BTreeSet<u64>, _, _>(DOC_ELIGIBLE, |set| {
                set.remove(&user_id);
            })
            .await?;
        Ok(())
    }

    pub fn registered_users(&self) -> Vec<u64> {
        let users: BTreeSet<u64> = self.store.load(DOC_USERS);
        users.into_iter().collect()
    }

    pub fn registered_count(&self) -> usize {
        let users: BTreeSet<u64> = self.store.load(DOC_USERS);
        users.len()
    }
}
