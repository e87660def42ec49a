//! Session grouping for one commit pass
//!
//! Ordered sessions are committed as a whole by a single task. Unordered
//! messages carry no ordering constraint, so when the worker pool has more
//! capacity than there are ordered sessions, unordered buckets are split
//! round-robin into synthetic sub-sessions to use it.

use std::collections::BTreeMap;

use crate::models::{is_unordered_session, SdpMsgWrapper};

#[derive(Debug, Clone)]
pub struct Session {
    /// Session key, also the cluster lock name
    pub key: String,
    pub ordered: bool,
    pub messages: Vec<SdpMsgWrapper>,
}

pub fn group_sessions(messages: Vec<SdpMsgWrapper>, pool_size: usize) -> Vec<Session> {
    let mut buckets: BTreeMap<String, Vec<SdpMsgWrapper>> = BTreeMap::new();
    for msg in messages {
        buckets.entry(msg.session_key()).or_default().push(msg);
    }

    let (unordered, ordered): (Vec<_>, Vec<_>) = buckets
        .into_iter()
        .partition(|(key, _)| is_unordered_session(key));

    let spare = pool_size.saturating_sub(ordered.len());
    let unordered_total: usize = unordered.iter().map(|(_, msgs)| msgs.len()).sum();

    let mut sessions: Vec<Session> = ordered
        .into_iter()
        .map(|(key, messages)| Session {
            key,
            ordered: true,
            messages,
        })
        .collect();

    for (key, messages) in unordered {
        let parts = if spare <= 1 {
            1
        } else {
            (spare * messages.len() / unordered_total).clamp(1, messages.len())
        };
        sessions.extend(split_round_robin(key, messages, parts));
    }
    sessions
}

fn split_round_robin(key: String, messages: Vec<SdpMsgWrapper>, parts: usize) -> Vec<Session> {
    if parts <= 1 {
        return vec![Session {
            key,
            ordered: false,
            messages,
        }];
    }

    let mut subs: Vec<Session> = (0..parts)
        .map(|j| Session {
            key: format!("{}-{}", key, j),
            ordered: false,
            messages: Vec::new(),
        })
        .collect();
    for (i, msg) in messages.into_iter().enumerate() {
        subs[i % parts].messages.push(msg);
    }
    subs
}
