//! Tiered driver identity resolution with an ambiguity veto.

use fleetsync_core::{DriverCandidate, NationalId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::{DriverLookup, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    NationalId,
    ExactName,
    SimilarName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Found { driver_id: i64, tier: MatchTier },
    NotFound,
    /// Several drivers share the name fragment; guessing could merge two people.
    Ambiguous { candidates: Vec<DriverCandidate> },
}

impl Resolution {
    /// The existing driver to overwrite, if any. An ambiguous match is
    /// deliberately treated like no match so a new driver gets created.
    pub fn existing_driver(&self) -> Option<i64> {
        match self {
            Resolution::Found { driver_id, .. } => Some(*driver_id),
            Resolution::NotFound | Resolution::Ambiguous { .. } => None,
        }
    }
}

/// Uppercased, trimmed form used by the name tiers.
pub fn name_key(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Resolves a driver by national ID first, then exact name, then name
/// prefix/substring. Only a single candidate on a tier counts as a match.
pub async fn resolve_driver<L>(
    lookup: &mut L,
    name: &str,
    national_id: Option<&NationalId>,
) -> Result<Resolution, StoreError>
where
    L: DriverLookup + ?Sized,
{
    if let Some(id) = national_id {
        let matches = lookup.drivers_by_national_id(id).await?;
        match matches.as_slice() {
            [single] => {
                debug!(driver_id = single.driver_id, name = %single.name, "driver matched by national id");
                return Ok(Resolution::Found {
                    driver_id: single.driver_id,
                    tier: MatchTier::NationalId,
                });
            }
            [] => {}
            many => warn!(
                national_id = %id,
                driver_ids = ?many.iter().map(|c| c.driver_id).collect::<Vec<_>>(),
                "national id shared by several drivers, falling back to name"
            ),
        }
    }

    let key = name_key(name);
    if key.is_empty() {
        return Ok(Resolution::NotFound);
    }

    let exact = lookup.drivers_by_exact_name(&key).await?;
    if let [single] = exact.as_slice() {
        debug!(driver_id = single.driver_id, name = %single.name, "driver matched by exact name");
        return Ok(Resolution::Found {
            driver_id: single.driver_id,
            tier: MatchTier::ExactName,
        });
    }

    let mut similar = lookup.drivers_by_name_fragment(&key).await?;
    similar.sort_by_key(|c| c.driver_id);
    similar.dedup_by_key(|c| c.driver_id);
    match similar.len() {
        0 => Ok(Resolution::NotFound),
        1 => {
            let single = similar.remove(0);
            debug!(driver_id = single.driver_id, name = %single.name, "driver matched by similar name");
            Ok(Resolution::Found {
                driver_id: single.driver_id,
                tier: MatchTier::SimilarName,
            })
        }
        _ => Ok(Resolution::Ambiguous {
            candidates: similar,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::ReconcileStore;
    use fleetsync_core::DriverProfile;

    fn driver(name: &str, national_id: Option<&str>) -> DriverProfile {
        DriverProfile {
            name: name.to_string(),
            national_id: national_id.and_then(NationalId::normalize),
            ..DriverProfile::default()
        }
    }

    async fn resolve(store: &MemoryStore, name: &str, id: Option<&str>) -> Resolution {
        let mut uow = store.begin().await.expect("begin");
        let id = id.and_then(NationalId::normalize);
        resolve_driver(&mut *uow, name, id.as_ref())
            .await
            .expect("resolve")
    }

    #[tokio::test]
    async fn national_id_wins_regardless_of_name() {
        let store = MemoryStore::new();
        let id = store.seed_driver(driver("Joao da Silva", Some("12345678901")));
        store.seed_driver(driver("JOAO DA SILVA", None));

        let resolution = resolve(&store, "  j. silva ", Some("123.456.789-01")).await;
        assert_eq!(
            resolution,
            Resolution::Found {
                driver_id: id,
                tier: MatchTier::NationalId
            }
        );
    }

    #[tokio::test]
    async fn exact_name_is_case_insensitive() {
        let store = MemoryStore::new();
        let id = store.seed_driver(driver("Maria Souza", None));
        store.seed_driver(driver("Maria Souza Lima", None));

        let resolution = resolve(&store, " maria souza", None).await;
        assert_eq!(
            resolution,
            Resolution::Found {
                driver_id: id,
                tier: MatchTier::ExactName
            }
        );
    }

    #[tokio::test]
    async fn single_fragment_match_is_accepted() {
        let store = MemoryStore::new();
        let id = store.seed_driver(driver("PEDRO ALVES JUNIOR", None));

        let resolution = resolve(&store, "Alves", None).await;
        assert_eq!(
            resolution,
            Resolution::Found {
                driver_id: id,
                tier: MatchTier::SimilarName
            }
        );
    }

    #[tokio::test]
    async fn several_fragment_matches_are_ambiguous() {
        let store = MemoryStore::new();
        store.seed_driver(driver("CARLOS PEREIRA", None));
        store.seed_driver(driver("CARLOS PEREIRA NETO", None));

        let resolution = resolve(&store, "carlos", Some("111")).await;
        match &resolution {
            Resolution::Ambiguous { candidates } => {
                let names: Vec<_> = candidates.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["CARLOS PEREIRA", "CARLOS PEREIRA NETO"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
        assert_eq!(resolution.existing_driver(), None);
    }

    #[tokio::test]
    async fn duplicated_exact_names_are_ambiguous() {
        let store = MemoryStore::new();
        store.seed_driver(driver("ANA LIMA", None));
        store.seed_driver(driver("ana lima", None));

        let resolution = resolve(&store, "Ana Lima", None).await;
        assert!(matches!(resolution, Resolution::Ambiguous { ref candidates } if candidates.len() == 2));
    }

    #[tokio::test]
    async fn shared_national_id_falls_back_to_name() {
        let store = MemoryStore::new();
        store.seed_driver(driver("LUIS COSTA", Some("98765432100")));
        let id = store.seed_driver(driver("RITA COSTA", Some("98765432100")));

        let resolution = resolve(&store, "rita costa", Some("98765432100")).await;
        assert_eq!(
            resolution,
            Resolution::Found {
                driver_id: id,
                tier: MatchTier::ExactName
            }
        );
    }

    #[tokio::test]
    async fn unknown_driver_is_not_found() {
        let store = MemoryStore::new();
        store.seed_driver(driver("JOSE", None));

        let resolution = resolve(&store, "Fernanda", Some("55566677788")).await;
        assert_eq!(resolution, Resolution::NotFound);
        assert_eq!(resolution.existing_driver(), None);
    }
}
