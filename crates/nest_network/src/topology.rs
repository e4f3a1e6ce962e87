//! Topology description: the nests, edges and seeded storage a network is
//! built from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::NestError;
use crate::identity::NestId;
use crate::network::Network;

/// Roads between the crow nests of the village, as `"A-B"` pairs.
const CROW_ROADS: &[&str] = &[
    "Church Tower-Sportsgrounds",
    "Church Tower-Big Maple",
    "Big Maple-Sportsgrounds",
    "Big Maple-Woods",
    "Big Maple-Fabienne's Garden",
    "Fabienne's Garden-Woods",
    "Fabienne's Garden-Cow Pasture",
    "Cow Pasture-Big Oak",
    "Big Oak-Butcher Shop",
    "Butcher Shop-Tall Poplar",
    "Tall Poplar-Sportsgrounds",
    "Tall Poplar-Chateau",
    "Chateau-Great Pine",
    "Great Pine-Jacques' Farm",
    "Jacques' Farm-Hawthorn",
    "Great Pine-Hawthorn",
    "Hawthorn-Gilles' Garden",
    "Great Pine-Gilles' Garden",
    "Gilles' Garden-Big Oak",
    "Gilles' Garden-Butcher Shop",
    "Chateau-Butcher Shop",
];

/// A network layout that can be loaded from JSON and built into a
/// [`Network`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Nests without any edge still need to be listed here; nests named by
    /// an edge are created automatically.
    #[serde(default)]
    pub nests: Vec<NestId>,
    pub edges: Vec<(NestId, NestId)>,
    /// Initial contents of each nest's local storage.
    #[serde(default)]
    pub storage: BTreeMap<NestId, BTreeMap<String, String>>,
}

impl Topology {
    /// Build a topology from `"A-B"` edge strings.
    pub fn from_edges(edges: &[&str]) -> Result<Self, NestError> {
        let edges = edges
            .iter()
            .map(|edge| parse_edge(edge))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            edges,
            ..Self::default()
        })
    }

    /// The crow village, with a few caches stored away.
    pub fn crow_nests() -> Self {
        let mut topology = Self::from_edges(CROW_ROADS).unwrap_or_default();
        topology
            .store("Chateau", "treasure", "under the loose stone by the well")
            .store("Gilles' Garden", "food caches", "[\"Butcher Shop\", \"Big Oak\"]")
            .store("Church Tower", "enemies", "Farmer Jacques' dog");
        topology
    }

    /// Seed a key in a nest's storage.
    pub fn store(
        &mut self,
        nest: impl Into<NestId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.storage
            .entry(nest.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Every nest named anywhere in the topology, in order.
    pub fn nest_ids(&self) -> BTreeSet<NestId> {
        self.nests
            .iter()
            .cloned()
            .chain(self.edges.iter().flat_map(|(a, b)| [a.clone(), b.clone()]))
            .chain(self.storage.keys().cloned())
            .collect()
    }

    /// Create the nests and edges in a new network and seed their storage.
    /// The network is not started.
    pub fn build(&self, config: NetworkConfig) -> Result<Network, NestError> {
        let network = Network::new(config)?;
        for id in self.nest_ids() {
            network.create_nest(id)?;
        }
        for (a, b) in &self.edges {
            network.connect(a, b)?;
        }
        for (id, entries) in &self.storage {
            let nest = network.nest(id)?;
            for (key, value) in entries {
                nest.store(key.clone(), value.clone());
            }
        }
        Ok(network)
    }

    /// Load a topology from a JSON file.
    pub fn load(path: &Path) -> Result<Self, NestError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| NestError::Topology(format!("Cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| NestError::Topology(format!("Invalid topology {}: {e}", path.display())))
    }

    /// Save the topology to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), NestError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NestError::Topology(format!("Failed to serialize topology: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| NestError::Topology(format!("Failed to write {}: {e}", path.display())))
    }
}

fn parse_edge(edge: &str) -> Result<(NestId, NestId), NestError> {
    match edge.split_once('-') {
        Some((a, b)) if !a.trim().is_empty() && !b.trim().is_empty() => {
            Ok((NestId::from(a.trim()), NestId::from(b.trim())))
        }
        _ => Err(NestError::Topology(format!("invalid edge '{edge}', expected A-B"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_edges() {
        let topology = Topology::from_edges(&["A-B", " B - C "]).unwrap();
        assert_eq!(topology.edges.len(), 2);
        assert_eq!(topology.edges[1], (NestId::from("B"), NestId::from("C")));
        assert_eq!(topology.nest_ids().len(), 3);
    }

    #[test]
    fn test_parse_edge_rejects_garbage() {
        assert!(Topology::from_edges(&["A"]).is_err());
        assert!(Topology::from_edges(&["-B"]).is_err());
    }

    #[test]
    fn test_crow_nests() {
        let topology = Topology::crow_nests();
        assert_eq!(topology.edges.len(), CROW_ROADS.len());
        assert_eq!(topology.nest_ids().len(), 14);
        assert!(topology.storage.contains_key(&NestId::from("Chateau")));
    }

    #[test]
    fn test_build_seeds_storage_and_edges() {
        let mut topology = Topology::from_edges(&["A-B"]).unwrap();
        topology.nests.push(NestId::from("Lonely"));
        topology.store("B", "seeds", "42");

        let network = topology.build(NetworkConfig::default()).unwrap();
        assert_eq!(network.nest_ids().len(), 3);
        let b = network.nest(&NestId::from("B")).unwrap();
        assert_eq!(b.read_storage("seeds").as_deref(), Some("42"));
        assert!(b.is_neighbor(&NestId::from("A")));
        assert!(network.neighbors(&NestId::from("Lonely")).unwrap().is_empty());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let topology = Topology::from_edges(&["A-B"]).unwrap();
        assert!(topology.build(NetworkConfig::lossy(2.0)).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        let topology = Topology::crow_nests();
        topology.save(&path).unwrap();
        assert_eq!(Topology::load(&path).unwrap(), topology);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Topology::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, NestError::Topology(_)));
    }
}
