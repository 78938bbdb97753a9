use std::collections::HashMap;

use crate::helpers::normalize_channel;

/// Channel name → members, in join order. Fan-out iterates members in this
/// order so event sequences are reproducible.
#[derive(Debug, Default)]
pub struct ChannelIndex {
    channels: HashMap<String, Vec<String>>,
}

impl ChannelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join an agent to a channel, creating the channel on first member.
    /// Returns false when the agent was already a member.
    pub fn join(&mut self, channel: &str, agent: &str) -> bool {
        let key = normalize_channel(channel);
        if key.is_empty() {
            return false;
        }
        let members = self.channels.entry(key).or_default();
        if members.iter().any(|m| m == agent) {
            return false;
        }
        members.push(agent.to_string());
        true
    }

    /// Remove an agent from a channel; the channel disappears when empty.
    pub fn leave(&mut self, channel: &str, agent: &str) -> bool {
        let key = normalize_channel(channel);
        let Some(members) = self.channels.get_mut(&key) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m != agent);
        let removed = members.len() != before;
        if members.is_empty() {
            self.channels.remove(&key);
        }
        removed
    }

    /// Remove an agent from every channel (release path).
    pub fn remove_member(&mut self, agent: &str) {
        self.channels.retain(|_, members| {
            members.retain(|m| m != agent);
            !members.is_empty()
        });
    }

    pub fn members(&self, channel: &str) -> &[String] {
        self.channels
            .get(&normalize_channel(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, channel: &str, agent: &str) -> bool {
        self.members(channel).iter().any(|m| m == agent)
    }

    /// Channels an agent is subscribed to, for `list_agents` snapshots.
    pub fn channels_of(&self, agent: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == agent))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Whether two agents share at least one channel.
    pub fn share_channel(&self, a: &str, b: &str) -> bool {
        self.channels.values().any(|members| {
            members.iter().any(|m| m == a) && members.iter().any(|m| m == b)
        })
    }
}
