use crate::{EngineError, Member, TurnOrderRepository};

/// Resolve member IDs into display-ready members.
///
/// Each ID is looked up as an organization member, then as a stable member,
/// then (when it is the stable owner) through the owner's user profile. An ID
/// with no directory data anywhere is kept with the raw ID as display name.
/// Output follows input order.
///
/// # Errors
/// Returns [`EngineError::Storage`] when a directory lookup fails. Missing
/// directory data is never an error.
pub fn resolve_members<R>(
    repository: &R,
    stable_id: &str,
    organization_id: &str,
    member_ids: &[String],
) -> Result<Vec<Member>, EngineError>
where
    R: TurnOrderRepository + ?Sized,
{
    let mut owner: Option<Option<String>> = None;
    let mut members = Vec::with_capacity(member_ids.len());

    for user_id in member_ids {
        if let Some(profile) =
            repository.organization_member(organization_id, user_id).map_err(EngineError::Storage)?
        {
            members.push(Member::from_profile(user_id, &profile));
            continue;
        }

        if let Some(profile) =
            repository.stable_member(stable_id, user_id).map_err(EngineError::Storage)?
        {
            members.push(Member::from_profile(user_id, &profile));
            continue;
        }

        if owner.is_none() {
            owner = Some(repository.stable_owner(stable_id).map_err(EngineError::Storage)?);
        }
        if owner.as_ref().and_then(Option::as_deref) == Some(user_id.as_str()) {
            if let Some(profile) = repository.user_profile(user_id).map_err(EngineError::Storage)? {
                members.push(Member::from_profile(user_id, &profile));
                continue;
            }
        }

        tracing::debug!(user_id = %user_id, stable_id, "no directory data, using raw id");
        members.push(Member::unresolved(user_id));
    }

    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryRepository, MemberProfile};

    fn profile(first: &str, last: &str, email: Option<&str>) -> MemberProfile {
        MemberProfile {
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            email: email.map(ToString::to_string),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn resolves_through_organization_stable_and_owner_sources_in_input_order() {
        let mut repository = InMemoryRepository::new();
        repository.upsert_organization_member("org-1", "u1", profile("Anna", "Berg", None));
        repository.upsert_stable_member("stable-1", "u2", profile("", "", Some("bo@example.com")));
        repository.set_stable_owner("stable-1", "owner");
        let owner_profile = profile("Olle", "Ägare", Some("olle@example.com"));
        repository.upsert_user_profile("owner", owner_profile);
        repository.upsert_user_profile("u3", profile("Not", "Owner", None));

        let members = match resolve_members(
            &repository,
            "stable-1",
            "org-1",
            &ids(&["u3", "owner", "u2", "u1"]),
        ) {
            Ok(members) => members,
            Err(err) => panic!("resolution should succeed: {err}"),
        };

        let names = members.iter().map(|member| member.user_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["u3", "Olle Ägare", "bo@example.com", "Anna Berg"]);
        assert_eq!(members[1].user_email.as_deref(), Some("olle@example.com"));
        assert_eq!(members[0].user_email, None);
    }

    #[test]
    fn organization_membership_wins_over_stable_membership() {
        let mut repository = InMemoryRepository::new();
        repository.upsert_organization_member("org-1", "u1", profile("Org", "Name", None));
        repository.upsert_stable_member("stable-1", "u1", profile("Stable", "Name", None));

        let members = match resolve_members(&repository, "stable-1", "org-1", &ids(&["u1"])) {
            Ok(members) => members,
            Err(err) => panic!("resolution should succeed: {err}"),
        };
        assert_eq!(members[0].user_name, "Org Name");
    }

    #[test]
    fn memberships_from_other_tenants_are_not_used() {
        let mut repository = InMemoryRepository::new();
        repository.upsert_organization_member("org-2", "u1", profile("Other", "Org", None));
        repository.upsert_stable_member("stable-2", "u1", profile("Other", "Stable", None));

        let members = match resolve_members(&repository, "stable-1", "org-1", &ids(&["u1"])) {
            Ok(members) => members,
            Err(err) => panic!("resolution should succeed: {err}"),
        };
        assert_eq!(members, vec![Member::unresolved("u1")]);
    }
}
