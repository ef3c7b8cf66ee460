//! Agent roster with asynchronous identity merging.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One agent as reported by `agents.list`. Immutable snapshot per refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub identity: Option<AgentIdentity>,
}

/// Identity metadata, fetched per agent after the list arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Response payload of `agents.list`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentListPayload {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default, rename = "defaultId")]
    pub default_id: Option<String>,
}

/// The current set of known agents plus their lazily-arriving identities.
///
/// The agent list is replaced wholesale on every refresh; identities are
/// merged in by id as the per-agent fetches resolve, and survive a list
/// replacement so names do not flicker back to raw ids.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    agents: Vec<Agent>,
    identities: HashMap<String, AgentIdentity>,
    default_id: Option<String>,
}

impl AgentRoster {
    /// Replace the agent list with a fresh snapshot.
    pub fn replace(&mut self, agents: Vec<Agent>, default_id: Option<String>) {
        self.default_id = default_id.or_else(|| agents.first().map(|a| a.id.clone()));
        self.agents = agents;
    }

    /// Merge identity metadata into the roster by agent id.
    pub fn merge_identity(&mut self, agent_id: impl Into<String>, identity: AgentIdentity) {
        self.identities.insert(agent_id.into(), identity);
    }

    /// All known agents, in gateway order.
    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// The gateway's default agent id (falls back to the first listed).
    #[must_use]
    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    /// Look up an agent by id.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// Whether the roster contains the given agent.
    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    /// Best display name: list name, then merged identity name, then the
    /// identity embedded in the list entry, then the raw id.
    #[must_use]
    pub fn display_name<'a>(&'a self, agent_id: &'a str) -> &'a str {
        let agent = self.get(agent_id);
        agent
            .and_then(|a| a.name.as_deref())
            .or_else(|| self.identities.get(agent_id).and_then(|i| i.name.as_deref()))
            .or_else(|| {
                agent
                    .and_then(|a| a.identity.as_ref())
                    .and_then(|i| i.name.as_deref())
            })
            .unwrap_or(agent_id)
    }

    /// Merged identity for an agent, if one has arrived.
    #[must_use]
    pub fn identity(&self, agent_id: &str) -> Option<&AgentIdentity> {
        self.identities.get(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, name: Option<&str>) -> Agent {
        Agent {
            id: id.into(),
            name: name.map(Into::into),
            model: None,
            identity: None,
        }
    }

    #[test]
    fn default_falls_back_to_first_agent() {
        let mut roster = AgentRoster::default();
        roster.replace(vec![agent("main", None), agent("dev", None)], None);
        assert_eq!(roster.default_id(), Some("main"));

        roster.replace(vec![agent("main", None), agent("dev", None)], Some("dev".into()));
        assert_eq!(roster.default_id(), Some("dev"));
    }

    #[test]
    fn display_name_precedence() {
        let mut roster = AgentRoster::default();
        roster.replace(vec![agent("dev", None)], None);
        assert_eq!(roster.display_name("dev"), "dev");

        roster.merge_identity(
            "dev",
            AgentIdentity {
                name: Some("Dev Agent".into()),
                about: None,
                description: None,
            },
        );
        assert_eq!(roster.display_name("dev"), "Dev Agent");

        roster.replace(vec![agent("dev", Some("Developer"))], None);
        assert_eq!(roster.display_name("dev"), "Developer");
    }

    #[test]
    fn identities_survive_list_replacement() {
        let mut roster = AgentRoster::default();
        roster.replace(vec![agent("ops", None)], None);
        roster.merge_identity(
            "ops",
            AgentIdentity {
                name: Some("Ops".into()),
                about: None,
                description: None,
            },
        );
        roster.replace(vec![agent("ops", None)], None);
        assert_eq!(roster.display_name("ops"), "Ops");
    }
}
