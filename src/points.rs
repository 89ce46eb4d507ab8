//! Point-of-interest records and the profiles used to select them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::GeoPoint;

/// An identified OSM node with its tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub id: i64,
    pub coord: GeoPoint,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl PointRecord {
    pub fn new(id: i64, coord: GeoPoint, tags: BTreeMap<String, String>) -> Self {
        Self { id, coord, tags }
    }

    /// True when this record satisfies every tag of `profile`.
    pub fn matches(&self, profile: &NodeProfile) -> bool {
        profile
            .tags
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|value| value == v))
    }

    /// True when this record satisfies at least one of `profiles`.
    pub fn matches_any(&self, profiles: &[NodeProfile]) -> bool {
        profiles.iter().any(|p| self.matches(p))
    }
}

/// A user-selectable tag filter, e.g. "Flock Safety ALPR".
///
/// Tags are AND-matched within a profile; a set of active profiles is
/// OR-matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NodeProfile {
    pub fn new(id: &str, name: &str, tags: &[(&str, &str)]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            enabled: true,
        }
    }

    /// Profiles shipped with the app.
    pub fn builtin() -> Vec<NodeProfile> {
        vec![
            NodeProfile::new(
                "builtin-generic-alpr",
                "Generic ALPR",
                &[
                    ("surveillance", "public"),
                    ("surveillance:type", "ALPR"),
                    ("surveillance:zone", "traffic"),
                ],
            ),
            NodeProfile::new(
                "builtin-flock",
                "Flock Safety",
                &[
                    ("surveillance", "public"),
                    ("surveillance:type", "ALPR"),
                    ("surveillance:zone", "traffic"),
                    ("manufacturer", "Flock Safety"),
                    ("manufacturer:wikidata", "Q108485435"),
                ],
            ),
            NodeProfile::new(
                "builtin-motorola",
                "Motorola Solutions/Vigilant",
                &[
                    ("surveillance", "public"),
                    ("surveillance:type", "ALPR"),
                    ("surveillance:zone", "traffic"),
                    ("manufacturer", "Motorola Solutions"),
                    ("manufacturer:wikidata", "Q634815"),
                ],
            ),
        ]
    }

    /// Only the enabled profiles of `profiles`.
    pub fn enabled(profiles: &[NodeProfile]) -> Vec<NodeProfile> {
        profiles.iter().filter(|p| p.enabled).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tags: &[(&str, &str)]) -> PointRecord {
        PointRecord::new(
            1,
            GeoPoint::new(0.0, 0.0),
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_profile_tags_are_and_matched() {
        let profile = NodeProfile::new("p", "P", &[("a", "1"), ("b", "2")]);
        assert!(record(&[("a", "1"), ("b", "2"), ("c", "3")]).matches(&profile));
        assert!(!record(&[("a", "1")]).matches(&profile));
        assert!(!record(&[("a", "1"), ("b", "x")]).matches(&profile));
    }

    #[test]
    fn test_profiles_are_or_matched() {
        let a = NodeProfile::new("a", "A", &[("kind", "a")]);
        let b = NodeProfile::new("b", "B", &[("kind", "b")]);
        let point = record(&[("kind", "a")]);
        assert!(point.matches_any(&[a.clone(), b.clone()]));
        assert!(point.matches_any(&[a]));
        assert!(!point.matches_any(&[b]));
        assert!(!point.matches_any(&[]));
    }

    #[test]
    fn test_builtin_flock_matches_generic() {
        let builtin = NodeProfile::builtin();
        let flock = builtin.iter().find(|p| p.id == "builtin-flock").unwrap();
        let generic = &builtin[0];
        let point = PointRecord::new(7, GeoPoint::new(1.0, 2.0), flock.tags.clone());
        assert!(point.matches(generic));
        assert!(point.matches(flock));
    }

    #[test]
    fn test_enabled_defaults_true_when_missing() {
        let profile: NodeProfile =
            serde_json::from_str(r#"{"id":"x","name":"X","tags":{"k":"v"}}"#).unwrap();
        assert!(profile.enabled);
    }
}
