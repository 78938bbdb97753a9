use std::collections::HashMap;

use crate::channels::ChannelIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Agent(String),
    Channel(String),
    Broadcast,
}

impl TargetSelector {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed == "*" {
            TargetSelector::Broadcast
        } else if let Some(channel) = trimmed.strip_prefix('#') {
            TargetSelector::Channel(channel.to_string())
        } else {
            TargetSelector::Agent(trimmed.trim_start_matches('@').to_string())
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingAgent<'a> {
    pub name: &'a str,
    pub parent: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutePlan {
    pub recipients: Vec<String>,
    /// (agent, its owner chain) pairs rejected by the ACL.
    pub denied: Vec<(String, Vec<String>)>,
}

/// Transitive "spawned by" walk, nearest parent first. Bounded by the agent
/// count so a corrupt parent edge cannot loop.
pub fn owner_chain(agents: &[RoutingAgent<'_>], name: &str) -> Vec<String> {
    let parents: HashMap<&str, Option<&str>> =
        agents.iter().map(|a| (a.name, a.parent)).collect();

    let mut chain = Vec::new();
    let mut cursor = parents.get(name).copied().flatten();
    while let Some(parent) = cursor {
        if chain.iter().any(|seen| seen == parent) || chain.len() >= agents.len() {
            break;
        }
        chain.push(parent.to_string());
        cursor = parents.get(parent).copied().flatten();
    }
    chain
}

/// Operators — senders that are not registered agents, including explicit
/// `human:` identities — bypass the ACL entirely.
pub fn sender_is_operator(sender: &str, agents: &[RoutingAgent<'_>]) -> bool {
    sender.starts_with("human:")
        || !agents.iter().any(|a| a.name.eq_ignore_ascii_case(sender))
}

/// Owner-chain-or-shared-channel ACL for agent senders.
fn may_send(
    sender: &str,
    target: &str,
    agents: &[RoutingAgent<'_>],
    channels: &ChannelIndex,
) -> bool {
    owner_chain(agents, target).iter().any(|owner| owner == sender)
        || channels.share_channel(sender, target)
}

/// Resolve a send request to recipients in deterministic order, applying the
/// ACL per recipient. `agents` must be in spawn order; channel fan-out uses
/// join order.
pub fn resolve(
    selector: &TargetSelector,
    sender: &str,
    agents: &[RoutingAgent<'_>],
    channels: &ChannelIndex,
) -> Result<RoutePlan, RouteError> {
    let operator = sender_is_operator(sender, agents);
    let mut plan = RoutePlan::default();

    let candidates: Vec<String> = match selector {
        TargetSelector::Agent(name) => {
            let found = agents
                .iter()
                .find(|a| a.name.eq_ignore_ascii_case(name))
                .map(|a| a.name.to_string())
                .ok_or_else(|| RouteError::UnknownTarget(name.clone()))?;
            if found.eq_ignore_ascii_case(sender) {
                Vec::new()
            } else {
                vec![found]
            }
        }
        TargetSelector::Channel(channel) => channels
            .members(channel)
            .iter()
            .filter(|member| !member.eq_ignore_ascii_case(sender))
            .cloned()
            .collect(),
        TargetSelector::Broadcast => agents
            .iter()
            .filter(|a| !a.name.eq_ignore_ascii_case(sender))
            .map(|a| a.name.to_string())
            .collect(),
    };

    for candidate in candidates {
        if operator || may_send(sender, &candidate, agents, channels) {
            plan.recipients.push(candidate);
        } else {
            let chain = owner_chain(agents, &candidate);
            tracing::debug!(
                target = "fleet::router",
                sender = %sender,
                denied = %candidate,
                owner_chain = ?chain,
                "acl denied delivery"
            );
            plan.denied.push((candidate, chain));
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use crate::channels::ChannelIndex;

    use super::{owner_chain, resolve, sender_is_operator, RouteError, RoutingAgent, TargetSelector};

    fn agents() -> Vec<(String, Option<String>)> {
        vec![
            ("Lead".to_string(), None),
            ("Worker1".to_string(), Some("Lead".to_string())),
            ("Worker2".to_string(), Some("Lead".to_string())),
            ("Grandchild".to_string(), Some("Worker1".to_string())),
        ]
    }

    fn routing<'a>(raw: &'a [(String, Option<String>)]) -> Vec<RoutingAgent<'a>> {
        raw.iter()
            .map(|(name, parent)| RoutingAgent {
                name,
                parent: parent.as_deref(),
            })
            .collect()
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(TargetSelector::parse("*"), TargetSelector::Broadcast);
        assert_eq!(
            TargetSelector::parse("#team"),
            TargetSelector::Channel("team".into())
        );
        assert_eq!(
            TargetSelector::parse("@Worker1"),
            TargetSelector::Agent("Worker1".into())
        );
        assert_eq!(
            TargetSelector::parse(" Worker1 "),
            TargetSelector::Agent("Worker1".into())
        );
    }

    #[test]
    fn owner_chain_walks_to_root() {
        let raw = agents();
        let agents = routing(&raw);
        assert_eq!(owner_chain(&agents, "Grandchild"), vec!["Worker1", "Lead"]);
        assert_eq!(owner_chain(&agents, "Lead"), Vec::<String>::new());
    }

    #[test]
    fn owner_chain_survives_cycles() {
        let raw = vec![
            ("A".to_string(), Some("B".to_string())),
            ("B".to_string(), Some("A".to_string())),
        ];
        let agents = routing(&raw);
        let chain = owner_chain(&agents, "A");
        assert!(chain.len() <= 2);
    }

    #[test]
    fn unknown_agent_target_errors() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let err = resolve(
            &TargetSelector::parse("Nobody"),
            "Lead",
            &agents,
            &channels,
        )
        .unwrap_err();
        assert_eq!(err, RouteError::UnknownTarget("Nobody".into()));
    }

    #[test]
    fn spawner_may_message_descendants() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let plan = resolve(
            &TargetSelector::parse("Grandchild"),
            "Lead",
            &agents,
            &channels,
        )
        .unwrap();
        assert_eq!(plan.recipients, vec!["Grandchild"]);
        assert!(plan.denied.is_empty());
    }

    #[test]
    fn sibling_without_shared_channel_is_denied() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let plan = resolve(
            &TargetSelector::parse("Worker2"),
            "Worker1",
            &agents,
            &channels,
        )
        .unwrap();
        assert!(plan.recipients.is_empty());
        assert_eq!(plan.denied[0].0, "Worker2");
        assert_eq!(plan.denied[0].1, vec!["Lead"]);
    }

    #[test]
    fn shared_channel_grants_access() {
        let raw = agents();
        let agents = routing(&raw);
        let mut channels = ChannelIndex::new();
        channels.join("team", "Worker1");
        channels.join("team", "Worker2");
        let plan = resolve(
            &TargetSelector::parse("Worker2"),
            "Worker1",
            &agents,
            &channels,
        )
        .unwrap();
        assert_eq!(plan.recipients, vec!["Worker2"]);
    }

    #[test]
    fn channel_fanout_excludes_sender_in_join_order() {
        let raw = agents();
        let agents = routing(&raw);
        let mut channels = ChannelIndex::new();
        channels.join("team", "Worker2");
        channels.join("team", "Worker1");
        channels.join("team", "Lead");
        let plan = resolve(
            &TargetSelector::parse("#team"),
            "Lead",
            &agents,
            &channels,
        )
        .unwrap();
        assert_eq!(plan.recipients, vec!["Worker2", "Worker1"]);
    }

    #[test]
    fn empty_channel_resolves_to_nothing() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let plan = resolve(
            &TargetSelector::parse("#ghosts"),
            "Lead",
            &agents,
            &channels,
        )
        .unwrap();
        assert!(plan.recipients.is_empty());
        assert!(plan.denied.is_empty());
    }

    #[test]
    fn broadcast_excludes_sender_in_spawn_order() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let plan = resolve(&TargetSelector::Broadcast, "Worker1", &agents, &channels).unwrap();
        // Worker1 spawned Grandchild; Lead and Worker2 are outside its chain.
        assert_eq!(plan.recipients, vec!["Grandchild"]);
        assert_eq!(plan.denied.len(), 2);
    }

    #[test]
    fn operators_bypass_acl() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        assert!(sender_is_operator("human:orchestrator", &agents));
        assert!(sender_is_operator("sdk-client", &agents));
        assert!(!sender_is_operator("Worker1", &agents));

        let plan = resolve(&TargetSelector::Broadcast, "sdk-client", &agents, &channels).unwrap();
        assert_eq!(plan.recipients.len(), 4);
        assert!(plan.denied.is_empty());
    }

    #[test]
    fn self_target_resolves_to_nothing() {
        let raw = agents();
        let agents = routing(&raw);
        let channels = ChannelIndex::new();
        let plan = resolve(
            &TargetSelector::parse("Lead"),
            "Lead",
            &agents,
            &channels,
        )
        .unwrap();
        assert!(plan.recipients.is_empty());
    }
}
