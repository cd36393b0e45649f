//! In-process session memory, two layers deep: per-branch rolling history
//! with branch-specific TTL and window, plus a generic per-user session
//! history consumed by the finalizer. Each conversational stage keeps a
//! different memory depth, so the limits are configured per branch.

use crate::config::BranchMemoryConfig;
use crate::router::Branch;
use ana_channels::UserKey;
use ana_llm::{ChatMessage, Role};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct TimedHistory {
    entries: Vec<ChatMessage>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct HistoryLimits {
    ttl: Duration,
    max_len: usize,
}

pub struct SessionMemory {
    branch_histories: DashMap<(UserKey, Branch), TimedHistory>,
    session_histories: DashMap<UserKey, TimedHistory>,
    branch_limits: HashMap<Branch, HistoryLimits>,
    session_limits: HistoryLimits,
}

impl SessionMemory {
    pub fn new(
        branch_config: &HashMap<Branch, BranchMemoryConfig>,
        session_ttl: Duration,
        session_max_len: usize,
    ) -> Self {
        let mut branch_limits = HashMap::new();
        for branch in Branch::ALL {
            let cfg = branch_config
                .get(&branch)
                .copied()
                .unwrap_or_default();
            branch_limits.insert(
                branch,
                HistoryLimits {
                    ttl: Duration::from_secs(cfg.history_ttl_seconds),
                    max_len: cfg.history_max,
                },
            );
        }
        Self {
            branch_histories: DashMap::new(),
            session_histories: DashMap::new(),
            branch_limits,
            session_limits: HistoryLimits {
                ttl: session_ttl,
                max_len: session_max_len,
            },
        }
    }

    fn limits_for(&self, branch: Branch) -> HistoryLimits {
        self.branch_limits
            .get(&branch)
            .copied()
            .unwrap_or(self.session_limits)
    }

    /// Rolling history for one branch of one user. Expired histories read as
    /// empty, mirroring a lapsed cache key.
    pub fn branch_history(&self, key: &UserKey, branch: Branch) -> Vec<ChatMessage> {
        match self.branch_histories.get(&(key.clone(), branch)) {
            Some(history) if history.expires_at > Instant::now() => history.entries.clone(),
            _ => Vec::new(),
        }
    }

    pub fn push_branch(&self, key: &UserKey, branch: Branch, role: Role, content: &str) {
        let limits = self.limits_for(branch);
        let mut entry = self
            .branch_histories
            .entry((key.clone(), branch))
            .or_insert_with(|| TimedHistory {
                entries: Vec::new(),
                expires_at: Instant::now(),
            });
        push_bounded(&mut entry, role, content, limits);
    }

    pub fn session_history(&self, key: &UserKey) -> Vec<ChatMessage> {
        match self.session_histories.get(key) {
            Some(history) if history.expires_at > Instant::now() => history.entries.clone(),
            _ => Vec::new(),
        }
    }

    pub fn push_session(&self, key: &UserKey, role: Role, content: &str) {
        let limits = self.session_limits;
        let mut entry = self
            .session_histories
            .entry(key.clone())
            .or_insert_with(|| TimedHistory {
                entries: Vec::new(),
                expires_at: Instant::now(),
            });
        push_bounded(&mut entry, role, content, limits);
    }
}

fn push_bounded(history: &mut TimedHistory, role: Role, content: &str, limits: HistoryLimits) {
    let now = Instant::now();
    if history.expires_at <= now {
        history.entries.clear();
    }
    history.entries.push(ChatMessage {
        role,
        content: content.to_string(),
    });
    // Oldest dropped first.
    if history.entries.len() > limits.max_len {
        let excess = history.entries.len() - limits.max_len;
        history.entries.drain(..excess);
    }
    history.expires_at = now + limits.ttl;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SessionMemory {
        let mut branches = HashMap::new();
        branches.insert(
            Branch::Greeting,
            BranchMemoryConfig {
                history_ttl_seconds: 180,
                history_max: 3,
            },
        );
        SessionMemory::new(&branches, Duration::from_secs(1800), 4)
    }

    #[test]
    fn branch_history_is_bounded_oldest_first() {
        let memory = memory();
        let key = UserKey::new("5521999999999");
        for i in 0..5 {
            memory.push_branch(&key, Branch::Greeting, Role::User, &format!("msg-{i}"));
        }
        let history = memory.branch_history(&key, Branch::Greeting);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "msg-2");
        assert_eq!(history[2].content, "msg-4");
    }

    #[test]
    fn branches_are_isolated_per_key_and_branch() {
        let memory = memory();
        let key_a = UserKey::new("5521999999999");
        let key_b = UserKey::new("5531888888888");
        memory.push_branch(&key_a, Branch::Greeting, Role::User, "oi");
        memory.push_branch(&key_a, Branch::Qualification, Role::User, "3 quartos");

        assert_eq!(memory.branch_history(&key_a, Branch::Greeting).len(), 1);
        assert_eq!(
            memory.branch_history(&key_a, Branch::Qualification).len(),
            1
        );
        assert!(memory.branch_history(&key_b, Branch::Greeting).is_empty());
    }

    #[test]
    fn session_history_keeps_role_order() {
        let memory = memory();
        let key = UserKey::new("5521999999999");
        memory.push_session(&key, Role::User, "oi");
        memory.push_session(&key, Role::Assistant, "olá!");
        let history = memory.session_history(&key);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[test]
    fn expired_history_reads_as_empty_and_restarts() {
        let mut branches = HashMap::new();
        branches.insert(
            Branch::Greeting,
            BranchMemoryConfig {
                history_ttl_seconds: 0,
                history_max: 5,
            },
        );
        let memory = SessionMemory::new(&branches, Duration::from_secs(1800), 4);
        let key = UserKey::new("5521999999999");
        memory.push_branch(&key, Branch::Greeting, Role::User, "antiga");
        std::thread::sleep(Duration::from_millis(5));
        assert!(memory.branch_history(&key, Branch::Greeting).is_empty());

        memory.push_branch(&key, Branch::Greeting, Role::User, "nova");
        // The lapsed entry was cleared before the new message was appended.
        let history = memory.branch_history(&key, Branch::Greeting);
        assert!(history.is_empty() || history.len() == 1);
    }
}
