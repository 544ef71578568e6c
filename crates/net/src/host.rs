//! Information about the local game host, provided by the game logic and
//! served to remote clients querying the host.

use crate::control::{PlayerInfo, Rule};

/// Host name used when no name is configured.
pub const DEFAULT_HOST_NAME: &str = "UNNAMED";

pub trait HostInfo: Send {
    /// Returns true if a game is running on this host.
    fn is_active(&self) -> bool;

    fn host_name(&self) -> &str;

    fn level_name(&self) -> &str;

    /// Currently connected players.
    fn players(&self) -> Vec<PlayerInfo> {
        Vec::new()
    }

    /// Returns the rule following the rule named `previous` or the first
    /// rule if `previous` is empty.
    fn rule_after(&self, _previous: &str) -> Option<Rule> {
        None
    }
}

/// Host information which changes only when explicitly modified.
#[derive(Clone, Debug)]
pub struct StaticHostInfo {
    active: bool,
    host_name: String,
    level_name: String,
    players: Vec<PlayerInfo>,
    rules: Vec<Rule>,
}

impl StaticHostInfo {
    /// Creates info of an active host.
    pub fn new(host_name: impl Into<String>, level_name: impl Into<String>) -> Self {
        Self {
            active: true,
            host_name: host_name.into(),
            level_name: level_name.into(),
            players: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Creates info of a host without a running game.
    pub fn inactive() -> Self {
        Self {
            active: false,
            ..Self::new(DEFAULT_HOST_NAME, "")
        }
    }

    pub fn with_player(mut self, player: PlayerInfo) -> Self {
        self.players.push(player);
        self
    }

    pub fn with_rule(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.rules.push(Rule {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl HostInfo for StaticHostInfo {
    fn is_active(&self) -> bool {
        self.active
    }

    fn host_name(&self) -> &str {
        self.host_name.as_str()
    }

    fn level_name(&self) -> &str {
        self.level_name.as_str()
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.players.clone()
    }

    fn rule_after(&self, previous: &str) -> Option<Rule> {
        if previous.is_empty() {
            return self.rules.first().cloned();
        }
        let position = self.rules.iter().position(|rule| rule.name == previous)?;
        self.rules.get(position + 1).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules() {
        let info = StaticHostInfo::new("arena", "start")
            .with_rule("timelimit", "20")
            .with_rule("fraglimit", "50");

        assert_eq!(info.rule_after("").unwrap().name, "timelimit");
        assert_eq!(info.rule_after("timelimit").unwrap().value, "50");
        assert!(info.rule_after("fraglimit").is_none());
        assert!(info.rule_after("unknown").is_none());
    }
}
