//! Hackathon and project records, winners drafts, kept as JSON documents in a key-value store.

use crate::error::{Error, Result};
use crate::types::{OutcomeKind, Outcomes, WinnerSet};
use crate::utils::{parse_optional_address, parse_units};
use derive_more::Display;
use log::{debug, warn};
use redis::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use web3::types::{Address, U256};

pub const HACKATHONS_KEY: &str = "monadarena_hackathons";
pub const PROJECTS_KEY: &str = "monadarena_projects";
pub const WINNERS_KEY: &str = "monadarena_winners";

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

impl<T: KvStore + ?Sized> KvStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
}

/// Redis-backed store; each document is one string key.
#[derive(Debug, Display)]
#[display(fmt = "redis {}", endpoint)]
pub struct Db {
    endpoint: String,
    client: Client,
}

impl Db {
    /// Connect with a full `redis://` url as found in the config.
    pub fn open(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(endpoint)?,
            endpoint: endpoint.to_string(),
        })
    }
}

impl KvStore for Db {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_connection()?;
        Ok(redis::cmd("GET").arg(key).query(&mut conn)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.get_connection()?;
        Ok(redis::cmd("SET").arg(key).arg(value).query(&mut conn)?)
    }
}

/// Process-local store, used when no redis is configured.
#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<HashMap<String, String>>);

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.0.lock().map_err(|e| Error::Unknown(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.0.lock().map_err(|e| Error::Unknown(e.to_string()))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeOdds {
    pub odds: f64,
    /// Last known pool size in tokens.
    #[serde(default)]
    pub staked: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub id: String,
    pub team_name: String,
    pub project_name: String,
    pub tagline: String,
    pub description: String,
    pub category: String,
    pub tech_stack: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_url: Option<String>,
    pub total_staked: f64,
    pub thumbnail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub team_members: Vec<String>,
    pub project_owner_address: String,
    pub outcomes: Outcomes<OutcomeOdds>,
}

impl Project {
    pub fn odds(&self) -> Outcomes<f64> {
        Outcomes::from_fn(|o| self.outcomes[o].odds)
    }

    pub fn odds_for(&self, outcome: OutcomeKind) -> f64 {
        self.outcomes[outcome].odds
    }

    /// Last known staked values, shown while the ledger reports zero.
    pub fn fallback(&self) -> Outcomes<U256> {
        Outcomes::from_fn(|o| {
            let staked = self.outcomes[o].staked;
            if staked.is_finite() && staked > 0.0 {
                parse_units(&staked.to_string()).unwrap_or_default()
            } else {
                U256::zero()
            }
        })
    }

    pub fn owner(&self) -> Option<Address> {
        match parse_optional_address(&self.project_owner_address) {
            Ok(owner) => owner,
            Err(e) => {
                warn!("project {} has a bad owner address: {}", self.id, e);
                None
            }
        }
    }

    /// Who receives the owner share of a stake; the staker when no owner is set.
    pub fn payee(&self, staker: Address) -> Address {
        self.owner().unwrap_or(staker)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HackathonStatus {
    #[default]
    Active,
    Upcoming,
    Ended,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hackathon {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tagline: String,
    pub status: HackathonStatus,
    pub start_date: String,
    pub end_date: String,
    pub total_prize_pool: f64,
    pub total_projects: u64,
    pub total_staked: f64,
    pub thumbnail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub organizer: String,
    pub categories: Vec<String>,
    pub project_ids: Vec<String>,
}

/// Bundled records, overridden by whatever is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSeed {
    pub hackathons: BTreeMap<String, Hackathon>,
    pub projects: BTreeMap<String, Project>,
}

impl CatalogSeed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct Catalog<S: KvStore> {
    store: S,
    seed: CatalogSeed,
}

impl<S: KvStore> Catalog<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            seed: CatalogSeed::default(),
        }
    }

    pub fn with_seed(mut self, seed: CatalogSeed) -> Self {
        self.seed = seed;
        self
    }

    fn load<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.store.get(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(T::default()),
        }
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        debug!("saving {}", key);
        self.store.set(key, &serde_json::to_string(value)?)
    }

    /// Stored hackathons only.
    pub fn load_hackathons(&self) -> Result<BTreeMap<String, Hackathon>> {
        self.load(HACKATHONS_KEY)
    }

    pub fn save_hackathons(&self, hackathons: &BTreeMap<String, Hackathon>) -> Result<()> {
        self.save(HACKATHONS_KEY, hackathons)
    }

    pub fn load_projects(&self) -> Result<BTreeMap<String, Project>> {
        self.load(PROJECTS_KEY)
    }

    pub fn save_projects(&self, projects: &BTreeMap<String, Project>) -> Result<()> {
        self.save(PROJECTS_KEY, projects)
    }

    /// Seed records with the stored ones laid over them.
    pub fn all_hackathons(&self) -> Result<BTreeMap<String, Hackathon>> {
        let mut all = self.seed.hackathons.clone();
        all.extend(self.load_hackathons()?);
        Ok(all)
    }

    pub fn all_projects(&self) -> Result<BTreeMap<String, Project>> {
        let mut all = self.seed.projects.clone();
        all.extend(self.load_projects()?);
        Ok(all)
    }

    pub fn hackathon(&self, id: &str) -> Result<Option<Hackathon>> {
        Ok(self.all_hackathons()?.remove(id))
    }

    pub fn project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.all_projects()?.remove(id))
    }

    pub fn add_project(&self, project: Project) -> Result<BTreeMap<String, Project>> {
        let mut projects = self.load_projects()?;
        projects.insert(project.id.clone(), project);
        self.save_projects(&projects)?;
        Ok(projects)
    }

    /// Link a project once; returns whether the hackathon changed.
    pub fn add_project_to_hackathon(&self, hackathon_id: &str, project_id: &str) -> Result<bool> {
        let mut stored = self.load_hackathons()?;
        if !stored.contains_key(hackathon_id) {
            match self.seed.hackathons.get(hackathon_id) {
                Some(seeded) => {
                    stored.insert(hackathon_id.to_string(), seeded.clone());
                }
                None => return Ok(false),
            }
        }
        let hackathon = match stored.get_mut(hackathon_id) {
            Some(h) => h,
            None => return Ok(false),
        };
        if hackathon.project_ids.iter().any(|p| p == project_id) {
            return Ok(false);
        }
        hackathon.project_ids.push(project_id.to_string());
        hackathon.total_projects += 1;
        self.save_hackathons(&stored)?;
        Ok(true)
    }

    pub fn save_winners(&self, hackathon_id: &str, winners: &WinnerSet) -> Result<()> {
        let mut all: BTreeMap<String, WinnerSet> = self.load(WINNERS_KEY)?;
        all.insert(hackathon_id.to_string(), winners.clone());
        self.save(WINNERS_KEY, &all)
    }

    pub fn load_winners(&self, hackathon_id: &str) -> Result<Option<WinnerSet>> {
        let mut all: BTreeMap<String, WinnerSet> = self.load(WINNERS_KEY)?;
        Ok(all.remove(hackathon_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::units;

    #[test]
    fn db_opens_config_urls_lazily() {
        let db = Db::open("redis://127.0.0.1:6379/0").unwrap();
        assert_eq!(db.to_string(), "redis redis://127.0.0.1:6379/0");
        assert!(Db::open("not a redis url").is_err());
    }

    fn project(id: &str, owner: &str) -> Project {
        Project {
            id: id.to_string(),
            project_name: format!("Project {}", id),
            project_owner_address: owner.to_string(),
            outcomes: Outcomes {
                win_prize: OutcomeOdds { odds: 2.5, staked: 1500.0 },
                finalist: OutcomeOdds { odds: 1.5, staked: 0.5 },
                vc_meeting: OutcomeOdds { odds: 2.0, staked: 0.0 },
            },
            ..Default::default()
        }
    }

    #[test]
    fn project_fallbacks_and_owner() {
        let p = project("p1", "0x0000000000000000000000000000000000000000");
        assert_eq!(p.fallback().win_prize, units(1500));
        assert_eq!(p.fallback().finalist, units(1) / 2);
        assert_eq!(p.fallback().vc_meeting, U256::zero());
        assert_eq!(p.odds_for(OutcomeKind::WinPrize), 2.5);
        let staker = Address::repeat_byte(7);
        assert_eq!(p.payee(staker), staker);

        let p = project("p2", "0x81A1F0EaAe2a930B3CE1477e67500db7C6cA5719");
        assert_ne!(p.payee(staker), staker);
    }

    #[test]
    fn projects_and_hackathons_round_trip_the_store() {
        let catalog = Catalog::new(MemoryStore::default());
        assert!(catalog.load_hackathons().unwrap().is_empty());

        let mut hackathons = BTreeMap::new();
        hackathons.insert(
            "h1".to_string(),
            Hackathon {
                id: "h1".to_string(),
                name: "Monad Blitz".to_string(),
                ..Default::default()
            },
        );
        catalog.save_hackathons(&hackathons).unwrap();
        catalog.add_project(project("p1", "")).unwrap();

        assert!(catalog.add_project_to_hackathon("h1", "p1").unwrap());
        assert!(!catalog.add_project_to_hackathon("h1", "p1").unwrap());
        assert!(!catalog.add_project_to_hackathon("missing", "p1").unwrap());

        let h1 = catalog.hackathon("h1").unwrap().unwrap();
        assert_eq!(h1.project_ids, vec!["p1".to_string()]);
        assert_eq!(h1.total_projects, 1);
        assert_eq!(catalog.project("p1").unwrap().unwrap().odds().finalist, 1.5);
    }

    #[test]
    fn stored_records_override_seed() {
        let raw = r#"{
            "hackathons": {"h1": {"id": "h1", "name": "seeded", "status": "upcoming", "projectIds": []}},
            "projects": {"p1": {"id": "p1", "projectName": "seeded",
                "outcomes": {"winPrize": {"odds": 2, "staked": 10},
                             "finalist": {"odds": 1.5, "staked": 0},
                             "vcMeeting": {"odds": 2, "staked": 0}}}}
        }"#;
        let seed: CatalogSeed = serde_json::from_str(raw).unwrap();
        let catalog = Catalog::new(MemoryStore::default()).with_seed(seed);
        assert_eq!(catalog.hackathon("h1").unwrap().unwrap().status, HackathonStatus::Upcoming);

        assert!(catalog.add_project_to_hackathon("h1", "p9").unwrap());
        assert_eq!(catalog.hackathon("h1").unwrap().unwrap().total_projects, 1);

        let mut p1 = catalog.project("p1").unwrap().unwrap();
        assert_eq!(p1.fallback().win_prize, units(10));
        p1.project_name = "stored".to_string();
        catalog.add_project(p1).unwrap();
        assert_eq!(catalog.project("p1").unwrap().unwrap().project_name, "stored");
    }

    #[test]
    fn winners_are_kept_per_hackathon() {
        let catalog = Catalog::new(MemoryStore::default());
        assert_eq!(catalog.load_winners("h1").unwrap(), None);
        let mut winners = WinnerSet::default();
        winners.toggle("p1", OutcomeKind::WinPrize);
        winners.finalized = true;
        catalog.save_winners("h1", &winners).unwrap();
        catalog.save_winners("h2", &WinnerSet::default()).unwrap();
        assert_eq!(catalog.load_winners("h1").unwrap(), Some(winners));
    }
}
