//! Profile resolution across owner and scope levels.

use crate::db::{ConversionEvent, DbError, PostbackProfile, Store};

use std::collections::BTreeMap;

/// Every active profile that should receive this conversion, ordered by id.
///
/// Owner matches and scope matches (flow, offer, campaign, global) fan out;
/// a profile matching several predicates is returned once.
pub fn resolve_profiles(store: &Store, event: &ConversionEvent) -> Result<Vec<PostbackProfile>, DbError> {
    let candidates = store.find_candidate_profiles(event)?;
    Ok(dedup_by_id(candidates))
}

fn dedup_by_id(profiles: Vec<PostbackProfile>) -> Vec<PostbackProfile> {
    let mut by_id = BTreeMap::new();
    for profile in profiles {
        by_id.entry(profile.id).or_insert(profile);
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OwnerScope, ScopeType};
    use tempfile::NamedTempFile;

    fn profile(id: i64, owner_scope: OwnerScope, owner_id: i64, scope_type: ScopeType, scope_id: Option<i64>) -> PostbackProfile {
        PostbackProfile {
            id,
            owner_scope,
            owner_id,
            scope_type,
            scope_id,
            name: format!("profile-{}", id),
            endpoint_url: "https://tracker.test/pb".to_string(),
            ..Default::default()
        }
    }

    fn event() -> ConversionEvent {
        ConversionEvent {
            id: 1,
            owner_id: Some(1),
            advertiser_id: 10,
            partner_id: 20,
            offer_id: 30,
            campaign_id: 40,
            ..Default::default()
        }
    }

    #[test]
    fn test_fan_out_across_levels() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let profiles = [
            profile(1, OwnerScope::Owner, 1, ScopeType::Global, None),
            profile(2, OwnerScope::Advertiser, 10, ScopeType::Offer, Some(999)),
            profile(3, OwnerScope::Partner, 20, ScopeType::Campaign, Some(999)),
            profile(4, OwnerScope::Partner, 77, ScopeType::Flow, Some(40)),
            profile(5, OwnerScope::Partner, 77, ScopeType::Offer, Some(30)),
            profile(6, OwnerScope::Advertiser, 88, ScopeType::Campaign, Some(40)),
            // No predicate matches.
            profile(7, OwnerScope::Advertiser, 88, ScopeType::Offer, Some(31)),
            profile(8, OwnerScope::Partner, 21, ScopeType::Campaign, Some(41)),
        ];
        for p in &profiles {
            store.upsert_profile(p).unwrap();
        }
        store
            .upsert_profile(&PostbackProfile {
                is_active: false,
                ..profile(9, OwnerScope::Advertiser, 10, ScopeType::Global, None)
            })
            .unwrap();

        let resolved = resolve_profiles(&store, &event()).unwrap();
        assert_eq!(resolved.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_profile_matching_several_predicates_fires_once() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        // Matches by advertiser owner and by offer scope.
        store
            .upsert_profile(&profile(1, OwnerScope::Advertiser, 10, ScopeType::Offer, Some(30)))
            .unwrap();

        let resolved = resolve_profiles(&store, &event()).unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_dedup_keeps_first_and_orders() {
        let a = profile(3, OwnerScope::Owner, 1, ScopeType::Global, None);
        let b = profile(1, OwnerScope::Owner, 1, ScopeType::Global, None);
        let out = dedup_by_id(vec![a.clone(), b, a]);
        assert_eq!(out.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3]);
    }
}
