use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Spectator,
    #[default]
    Peaceful,
    Competitor,
    Squad(u8),
}

impl Team {
    /// Neutral teams spawn anywhere; only squads wait for a team spawn point.
    pub fn is_neutral(self) -> bool {
        !matches!(self, Team::Squad(_))
    }

    fn is_harmless(self) -> bool {
        matches!(self, Team::Spectator | Team::Peaceful)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRules {
    pub max_players_for_map: u32,
    pub possible_team_count: u32,
}

impl Default for MapRules {
    fn default() -> Self {
        Self {
            max_players_for_map: 16,
            possible_team_count: 2,
        }
    }
}

impl MapRules {
    pub fn team_capacity(&self) -> usize {
        (self.max_players_for_map / self.possible_team_count.max(1)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("team {team:?} is full ({population}/{capacity})")]
pub struct AdmissionDenied {
    pub team: Team,
    pub population: usize,
    pub capacity: usize,
}

/// Self relations and owner/pet relations are filtered out by the caller.
pub fn can_hit(attacker: Team, target: Team) -> bool {
    if attacker.is_harmless() || target.is_harmless() {
        return false;
    }
    attacker == Team::Competitor || target == Team::Competitor
}

/// `population` is the current non-spectator head count on `team`.
pub fn check_team_change(
    team: Team,
    population: usize,
    rules: &MapRules,
) -> Result<(), AdmissionDenied> {
    if team == Team::Spectator {
        return Ok(());
    }
    let capacity = rules.team_capacity();
    if population >= capacity {
        return Err(AdmissionDenied {
            team,
            population,
            capacity,
        });
    }
    Ok(())
}

pub fn can_change_team(team: Team, population: usize, rules: &MapRules) -> bool {
    check_team_change(team, population, rules).is_ok()
}
