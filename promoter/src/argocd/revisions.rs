//! Pairing configured source updates with an Application's sources, and the
//! revisions those updates ask for.

use anyhow::{Result, anyhow};

use crate::argocd::config::SourceUpdate;
use crate::argocd::types::{Application, ApplicationSource};
use crate::core::state::State;

/// Normalize a Git URL so equivalent spellings compare equal.
///
/// Lowercases, drops a trailing `/` and `.git`, and rewrites the scp-like
/// `git@host:path` form to `ssh://git@host/path`.
pub fn normalize_git_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();
    if !normalized.contains("://")
        && let Some((user_host, path)) = normalized.split_once(':')
        && user_host.contains('@')
    {
        normalized = format!("ssh://{user_host}/{}", path.trim_start_matches('/'));
    }
    while normalized.ends_with('/') {
        normalized.pop();
    }
    if let Some(stripped) = normalized.strip_suffix(".git") {
        normalized = stripped.to_string();
    }
    normalized
}

/// True when `update` targets `source`.
///
/// Git sources (no chart on either side) compare normalized URLs; chart
/// sources compare the repository URL and chart name exactly.
pub fn source_matches(source: &ApplicationSource, update: &SourceUpdate) -> bool {
    if source.chart.is_empty() && update.chart.is_empty() {
        return normalize_git_url(&source.repo_url) == normalize_git_url(&update.repo_url);
    }
    source.repo_url == update.repo_url && source.chart == update.chart
}

/// Pair each update with the first matching source not already claimed.
///
/// Returns, per source position, the index of the update applied to it, and
/// the indices of updates that matched no source.
pub fn assign_updates(
    sources: &[ApplicationSource],
    updates: &[SourceUpdate],
) -> (Vec<Option<usize>>, Vec<usize>) {
    let mut assigned = vec![None; sources.len()];
    let mut unmatched = Vec::new();
    for (update_index, update) in updates.iter().enumerate() {
        let slot = sources
            .iter()
            .enumerate()
            .find(|(position, source)| assigned[*position].is_none() && source_matches(source, update))
            .map(|(position, _)| position);
        match slot {
            Some(position) => assigned[position] = Some(update_index),
            None => unmatched.push(update_index),
        }
    }
    (assigned, unmatched)
}

/// Revision an update explicitly asks for. `""` means no opinion.
pub fn desired_revision(update: &SourceUpdate, state: &State) -> Result<String> {
    if let Some(revision) = update.desired_revision.as_deref().filter(|r| !r.is_empty()) {
        return Ok(revision.to_string());
    }
    if let Some(step) = update.desired_commit_from_step.as_deref() {
        let commit = state
            .get_field(step, "commit")
            .and_then(|commit| commit.as_str())
            .ok_or_else(|| {
                anyhow!("no commit found in the output of step {step:?} for {}", update.repo_url)
            })?;
        return Ok(commit.to_string());
    }
    Ok(String::new())
}

/// Desired revision for each of the Application's sources, in source order.
///
/// Sources without a matching update get `""`. Nothing is inferred from
/// freight: without an explicit update there is no opinion.
pub fn determine_desired_revisions(
    app: &Application,
    updates: &[SourceUpdate],
    state: &State,
) -> Result<Vec<String>> {
    let sources = app.spec.current_sources();
    let (assigned, _) = assign_updates(&sources, updates);
    assigned
        .into_iter()
        .map(|update| match update {
            Some(index) => desired_revision(&updates[index], state),
            None => Ok(String::new()),
        })
        .collect()
}
