//! Configuration of the `argocd-update` step, as it appears in a step's `config`.

use serde::{Deserialize, Serialize};

use crate::core::freight::FreightOrigin;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgoCdUpdateConfig {
    pub apps: Vec<AppUpdate>,
}

/// One Application to update and sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUpdate {
    pub name: String,
    /// Defaults to the configured Argo CD namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceUpdate>,
}

/// Changes to one of the Application's sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUpdate {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_revision: Option<String>,
    /// Alias of an earlier step whose output carries a `commit` to sync to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_commit_from_step: Option<String>,
    #[serde(default)]
    pub update_target_revision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KustomizeUpdate {
    pub images: Vec<KustomizeImageUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizeImageUpdate {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default)]
    pub use_digest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_origin: Option<FreightOrigin>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmUpdate {
    pub images: Vec<HelmImageUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmImageUpdate {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    /// Helm parameter name to set.
    pub key: String,
    pub value: HelmImageValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_origin: Option<FreightOrigin>,
}

/// Which part of the resolved image reference a Helm parameter receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelmImageValue {
    ImageAndTag,
    Tag,
    ImageAndDigest,
    Digest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_full_update() {
        let config: ArgoCdUpdateConfig = serde_json::from_value(json!({
            "apps": [{
                "name": "guestbook",
                "sources": [{
                    "repoURL": "https://github.com/example/guestbook.git",
                    "desiredCommitFromStep": "commit",
                    "updateTargetRevision": true,
                    "helm": {"images": [{
                        "repoURL": "ghcr.io/example/guestbook",
                        "key": "image.tag",
                        "value": "Tag"
                    }]}
                }]
            }]
        }))
        .expect("parse");

        let app = &config.apps[0];
        assert_eq!(app.namespace, None);
        let source = &app.sources[0];
        assert_eq!(source.desired_commit_from_step.as_deref(), Some("commit"));
        assert!(source.update_target_revision);
        let helm = source.helm.as_ref().expect("helm");
        assert_eq!(helm.images[0].value, HelmImageValue::Tag);
    }
}
