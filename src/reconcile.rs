//! Deciding whether incoming credentials belong to an existing profile, and
//! naming new ones.

use crate::credentials::{extract_access_token, normalize_email, AccountSummary};
use crate::profile::Profile;

pub const GENERIC_PROFILE_NAME: &str = "Codex Account";

/// Passes run over every profile and the first pass with a hit wins:
/// normalized email, then account id, then the exact access token.
pub fn match_existing_profile<F>(
    incoming_blob: &str,
    profiles: &[Profile],
    summarize: F,
) -> Option<String>
where
    F: Fn(&str) -> Option<AccountSummary>,
{
    let incoming = summarize(incoming_blob);
    let existing: Vec<(&Profile, Option<AccountSummary>)> = profiles
        .iter()
        .filter_map(|profile| {
            let blob = profile.cli_credentials.as_deref()?;
            Some((profile, summarize(blob)))
        })
        .collect();

    if let Some(email) = incoming
        .as_ref()
        .and_then(|summary| summary.email.as_deref())
        .and_then(normalize_email)
    {
        let hit = existing.iter().find(|(_, summary)| {
            summary
                .as_ref()
                .and_then(|summary| summary.email.as_deref())
                .and_then(normalize_email)
                .is_some_and(|candidate| candidate == email)
        });
        if let Some((profile, _)) = hit {
            return Some(profile.id.clone());
        }
    }

    if let Some(account_id) = incoming
        .as_ref()
        .and_then(|summary| summary.account_id.as_deref())
        .and_then(normalize_account_id)
    {
        let hit = existing.iter().find(|(_, summary)| {
            summary
                .as_ref()
                .and_then(|summary| summary.account_id.as_deref())
                .and_then(normalize_account_id)
                .is_some_and(|candidate| candidate == account_id)
        });
        if let Some((profile, _)) = hit {
            return Some(profile.id.clone());
        }
    }

    let access_token = extract_access_token(incoming_blob)?;
    existing
        .iter()
        .find(|(profile, _)| {
            profile
                .cli_credentials
                .as_deref()
                .and_then(extract_access_token)
                .is_some_and(|candidate| candidate == access_token)
        })
        .map(|(profile, _)| profile.id.clone())
}

/// `base` if unused, otherwise `base` with the lowest free " N" suffix
/// starting at 2. Comparison is exact.
pub fn unique_profile_name<'a, I>(base: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: Vec<&str> = existing.into_iter().collect();
    if !taken.contains(&base) {
        return base.to_string();
    }
    (2u32..)
        .map(|suffix| format!("{} {}", base, suffix))
        .find(|candidate| !taken.contains(&candidate.as_str()))
        .unwrap_or_else(|| base.to_string())
}

pub fn default_profile_name(summary: Option<&AccountSummary>) -> String {
    summary
        .and_then(|summary| summary.email.clone())
        .unwrap_or_else(|| GENERIC_PROFILE_NAME.to_string())
}

fn normalize_account_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_lowercase();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_support::canonical_blob;
    use crate::profile::ProfileSettings;

    fn profile_with(name: &str, blob: Option<String>) -> Profile {
        let mut profile = Profile::new(name, ProfileSettings::default());
        if let Some(blob) = blob {
            profile.store_cli_credentials(blob);
        }
        profile
    }

    fn matches(blob: &str, profiles: &[Profile]) -> Option<String> {
        match_existing_profile(blob, profiles, AccountSummary::from_blob)
    }

    #[test]
    fn email_match_is_case_and_whitespace_insensitive() {
        let existing = profile_with(
            "a",
            Some(canonical_blob("at-1", None, Some("A@X.com"), None)),
        );
        let incoming = canonical_blob("at-2", None, Some("  a@x.COM "), None);
        assert_eq!(matches(&incoming, &[existing.clone()]), Some(existing.id));
    }

    #[test]
    fn email_pass_runs_before_account_pass() {
        let by_account = profile_with(
            "by account",
            Some(canonical_blob("at-1", Some("acct-1"), Some("other@x.com"), None)),
        );
        let by_email = profile_with(
            "by email",
            Some(canonical_blob("at-2", Some("acct-2"), Some("me@x.com"), None)),
        );
        let incoming = canonical_blob("at-3", Some("acct-1"), Some("me@x.com"), None);
        assert_eq!(
            matches(&incoming, &[by_account, by_email.clone()]),
            Some(by_email.id)
        );
    }

    #[test]
    fn same_account_id_with_new_token_reuses_profile() {
        let existing = profile_with("a", Some(canonical_blob("at-old", Some("acct-9"), None, None)));
        let incoming = canonical_blob("at-new", Some("acct-9"), None, None);
        assert_eq!(matches(&incoming, &[existing.clone()]), Some(existing.id));
    }

    #[test]
    fn identity_free_blobs_match_only_on_exact_token() {
        let existing = profile_with("a", Some(canonical_blob("at-same", None, None, None)));
        assert_eq!(
            matches(&canonical_blob("at-same", None, None, None), &[existing.clone()]),
            Some(existing.id.clone())
        );
        assert_eq!(
            matches(&canonical_blob("at-different", None, None, None), &[existing]),
            None
        );
    }

    #[test]
    fn undecodable_blobs_never_match() {
        let existing = profile_with("a", Some(canonical_blob("at", None, None, None)));
        let empty = profile_with("empty", None);
        assert_eq!(matches("not json", &[existing, empty]), None);
    }

    #[test]
    fn colliding_names_get_lowest_free_suffix() {
        assert_eq!(unique_profile_name("a@x.com", ["b@x.com"]), "a@x.com");
        assert_eq!(unique_profile_name("a@x.com", ["a@x.com"]), "a@x.com 2");
        assert_eq!(
            unique_profile_name("a@x.com", ["a@x.com", "a@x.com 2"]),
            "a@x.com 3"
        );
        assert_eq!(
            unique_profile_name("a@x.com", ["a@x.com", "a@x.com 3"]),
            "a@x.com 2"
        );
    }

    #[test]
    fn default_name_prefers_email() {
        let summary = AccountSummary::from_blob(&canonical_blob("at", None, Some("me@x.com"), None));
        assert_eq!(default_profile_name(summary.as_ref()), "me@x.com");
        assert_eq!(default_profile_name(None), GENERIC_PROFILE_NAME);
    }
}
