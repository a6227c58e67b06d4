//! Building the sources an Application should have after an update.

use anyhow::{Result, anyhow, bail};

use crate::argocd::config::{HelmImageUpdate, HelmImageValue, KustomizeImageUpdate, SourceUpdate};
use crate::argocd::revisions::assign_updates;
use crate::argocd::types::{
    Application, ApplicationSource, ApplicationSourceHelm, ApplicationSourceKustomize,
    HelmParameter,
};
use crate::core::freight::{FreightCollection, FreightOrigin, FreightRequest, Image};
use crate::errors::TerminalError;

/// Freight a promotion carries, used to resolve image references.
#[derive(Debug, Clone, Copy)]
pub struct FreightView<'a> {
    pub requests: &'a [FreightRequest],
    pub collection: &'a FreightCollection,
}

impl FreightView<'_> {
    /// The image from `repo_url` among the promoted freight.
    ///
    /// With an origin, only that origin's freight is searched. Without one,
    /// the image must be unique across the requested origins.
    pub fn find_image(&self, repo_url: &str, origin: Option<&FreightOrigin>) -> Result<Image> {
        if let Some(origin) = origin {
            let freight = self
                .collection
                .from_origin(origin)
                .ok_or_else(|| anyhow!("no freight from {origin} in this promotion"))?;
            return freight
                .images
                .iter()
                .find(|image| image.repo_url == repo_url)
                .cloned()
                .ok_or_else(|| anyhow!("image {repo_url} not found in freight from {origin}"));
        }

        let mut candidates = self
            .collection
            .iter()
            .filter(|freight| {
                self.requests.is_empty()
                    || self.requests.iter().any(|request| request.origin == freight.origin)
            })
            .flat_map(|freight| freight.images.iter())
            .filter(|image| image.repo_url == repo_url);
        let Some(image) = candidates.next() else {
            bail!("image {repo_url} not found in the promoted freight");
        };
        if candidates.next().is_some() {
            bail!("image {repo_url} is found in more than one piece of freight; set fromOrigin");
        }
        Ok(image.clone())
    }
}

/// The Application's sources with the configured updates applied.
///
/// `desired_revisions` is aligned with the Application's sources. An update
/// that matches no source is a configuration error.
pub fn build_desired_sources(
    app: &Application,
    updates: &[SourceUpdate],
    desired_revisions: &[String],
    freight: FreightView<'_>,
) -> Result<Vec<ApplicationSource>> {
    let mut sources = app.spec.current_sources();
    let (assigned, unmatched) = assign_updates(&sources, updates);
    if let Some(&index) = unmatched.first() {
        let update = &updates[index];
        return Err(TerminalError::new(format!(
            "no source of Argo CD Application {} matches update for {}{}",
            app.key(),
            update.repo_url,
            if update.chart.is_empty() {
                String::new()
            } else {
                format!(" (chart {})", update.chart)
            }
        ))
        .into());
    }

    for (position, source) in sources.iter_mut().enumerate() {
        let Some(index) = assigned[position] else {
            continue;
        };
        let update = &updates[index];
        let revision = desired_revisions
            .get(position)
            .map(String::as_str)
            .unwrap_or_default();
        apply_update(source, update, revision, freight)?;
    }
    Ok(sources)
}

fn apply_update(
    source: &mut ApplicationSource,
    update: &SourceUpdate,
    desired_revision: &str,
    freight: FreightView<'_>,
) -> Result<()> {
    if update.update_target_revision && !desired_revision.is_empty() {
        source.target_revision = desired_revision.to_string();
    }

    if let Some(kustomize) = &update.kustomize
        && !kustomize.images.is_empty()
    {
        let target = source
            .kustomize
            .get_or_insert_with(ApplicationSourceKustomize::default);
        for image in &kustomize.images {
            let entry = kustomize_image_entry(image, freight)?;
            set_kustomize_image(&mut target.images, &image.repo_url, entry);
        }
    }

    if let Some(helm) = &update.helm
        && !helm.images.is_empty()
    {
        let target = source.helm.get_or_insert_with(ApplicationSourceHelm::default);
        for image in &helm.images {
            let value = helm_image_value(image, freight)?;
            set_helm_parameter(&mut target.parameters, &image.key, value);
        }
    }
    Ok(())
}

/// `repo[=newName](:tag|@digest)`
fn kustomize_image_entry(update: &KustomizeImageUpdate, freight: FreightView<'_>) -> Result<String> {
    let explicit_digest = update.digest.as_deref().filter(|d| !d.is_empty());
    let explicit_tag = update.tag.as_deref().filter(|t| !t.is_empty());
    let suffix = match (explicit_digest, explicit_tag) {
        (Some(digest), _) => format!("@{digest}"),
        (None, Some(tag)) => format!(":{tag}"),
        (None, None) => {
            let image = freight.find_image(&update.repo_url, update.from_origin.as_ref())?;
            if update.use_digest {
                if image.digest.is_empty() {
                    bail!("image {} in freight has no digest", update.repo_url);
                }
                format!("@{}", image.digest)
            } else {
                if image.tag.is_empty() {
                    bail!("image {} in freight has no tag", update.repo_url);
                }
                format!(":{}", image.tag)
            }
        }
    };
    let name = match update.new_name.as_deref().filter(|n| !n.is_empty()) {
        Some(new_name) => format!("{}={new_name}", update.repo_url),
        None => update.repo_url.clone(),
    };
    Ok(format!("{name}{suffix}"))
}

/// Image name an existing Kustomize override applies to.
fn kustomize_image_name(entry: &str) -> &str {
    if let Some((name, _)) = entry.split_once('=') {
        return name;
    }
    let without_digest = entry.split_once('@').map_or(entry, |(name, _)| name);
    match without_digest.rfind(':') {
        Some(colon) if !without_digest[colon..].contains('/') => &without_digest[..colon],
        _ => without_digest,
    }
}

fn set_kustomize_image(images: &mut Vec<String>, repo_url: &str, entry: String) {
    match images
        .iter()
        .position(|existing| kustomize_image_name(existing) == repo_url)
    {
        Some(index) => images[index] = entry,
        None => images.push(entry),
    }
}

fn helm_image_value(update: &HelmImageUpdate, freight: FreightView<'_>) -> Result<String> {
    let image = freight.find_image(&update.repo_url, update.from_origin.as_ref())?;
    let require = |part: &str, what: &str| -> Result<String> {
        if part.is_empty() {
            bail!("image {} in freight has no {what}", update.repo_url);
        }
        Ok(part.to_string())
    };
    Ok(match update.value {
        HelmImageValue::ImageAndTag => format!("{}:{}", image.repo_url, require(&image.tag, "tag")?),
        HelmImageValue::Tag => require(&image.tag, "tag")?,
        HelmImageValue::ImageAndDigest => {
            format!("{}@{}", image.repo_url, require(&image.digest, "digest")?)
        }
        HelmImageValue::Digest => require(&image.digest, "digest")?,
    })
}

fn set_helm_parameter(parameters: &mut Vec<HelmParameter>, name: &str, value: String) {
    match parameters.iter_mut().find(|param| param.name == name) {
        Some(param) => param.value = value,
        None => parameters.push(HelmParameter {
            name: name.to_string(),
            value,
            force_string: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argocd::config::{HelmUpdate, KustomizeUpdate};
    use crate::argocd::types::ApplicationSpec;
    use crate::core::freight::FreightReference;
    use crate::errors::is_terminal;

    fn freight() -> FreightCollection {
        let mut collection = FreightCollection::default();
        collection.insert(FreightReference {
            name: "f1".to_string(),
            origin: FreightOrigin::warehouse("images"),
            commits: Vec::new(),
            images: vec![Image {
                repo_url: "ghcr.io/example/app".to_string(),
                tag: "1.2.0".to_string(),
                digest: "sha256:abc".to_string(),
            }],
            charts: Vec::new(),
        });
        collection
    }

    fn app(source: ApplicationSource) -> Application {
        Application {
            spec: ApplicationSpec {
                source: Some(source),
                ..ApplicationSpec::default()
            },
            ..Application::default()
        }
    }

    fn git_source() -> ApplicationSource {
        ApplicationSource {
            repo_url: "https://github.com/example/config.git".to_string(),
            target_revision: "main".to_string(),
            ..ApplicationSource::default()
        }
    }

    #[test]
    fn target_revision_needs_request_and_revision() {
        let collection = freight();
        let view = FreightView {
            requests: &[],
            collection: &collection,
        };
        let mut update = SourceUpdate {
            repo_url: "https://github.com/example/config".to_string(),
            ..SourceUpdate::default()
        };

        let unchanged = build_desired_sources(&app(git_source()), &[update.clone()], &["abc".to_string()], view)
            .expect("build");
        assert_eq!(unchanged[0].target_revision, "main");

        update.update_target_revision = true;
        let no_revision = build_desired_sources(&app(git_source()), &[update.clone()], &[String::new()], view)
            .expect("build");
        assert_eq!(no_revision[0].target_revision, "main");

        let updated = build_desired_sources(&app(git_source()), &[update], &["abc".to_string()], view)
            .expect("build");
        assert_eq!(updated[0].target_revision, "abc");
    }

    #[test]
    fn kustomize_images_replace_by_name() {
        let mut source = git_source();
        source.kustomize = Some(ApplicationSourceKustomize {
            images: vec![
                "ghcr.io/example/app:1.0.0".to_string(),
                "ghcr.io/example/other:3".to_string(),
            ],
            ..ApplicationSourceKustomize::default()
        });
        let update = SourceUpdate {
            repo_url: source.repo_url.clone(),
            kustomize: Some(KustomizeUpdate {
                images: vec![KustomizeImageUpdate {
                    repo_url: "ghcr.io/example/app".to_string(),
                    ..KustomizeImageUpdate::default()
                }],
            }),
            ..SourceUpdate::default()
        };
        let collection = freight();
        let sources = build_desired_sources(
            &app(source),
            &[update],
            &[String::new()],
            FreightView {
                requests: &[],
                collection: &collection,
            },
        )
        .expect("build");

        let images = &sources[0].kustomize.as_ref().expect("kustomize").images;
        assert_eq!(
            images,
            &vec![
                "ghcr.io/example/app:1.2.0".to_string(),
                "ghcr.io/example/other:3".to_string()
            ]
        );
    }

    #[test]
    fn kustomize_entries_support_new_name_and_digest() {
        let collection = freight();
        let view = FreightView {
            requests: &[],
            collection: &collection,
        };
        let update = KustomizeImageUpdate {
            repo_url: "ghcr.io/example/app".to_string(),
            use_digest: true,
            new_name: Some("mirror.example.com/app".to_string()),
            ..KustomizeImageUpdate::default()
        };
        assert_eq!(
            kustomize_image_entry(&update, view).expect("entry"),
            "ghcr.io/example/app=mirror.example.com/app@sha256:abc"
        );
        assert_eq!(kustomize_image_name("ghcr.io/example/app=mirror/app:1"), "ghcr.io/example/app");
        assert_eq!(kustomize_image_name("localhost:5000/app@sha256:1"), "localhost:5000/app");
        assert_eq!(kustomize_image_name("localhost:5000/app"), "localhost:5000/app");
    }

    #[test]
    fn helm_parameters_replace_or_append() {
        let mut source = git_source();
        source.helm = Some(ApplicationSourceHelm {
            parameters: vec![HelmParameter {
                name: "image.tag".to_string(),
                value: "1.0.0".to_string(),
                force_string: true,
            }],
            ..ApplicationSourceHelm::default()
        });
        let images = vec![
            HelmImageUpdate {
                repo_url: "ghcr.io/example/app".to_string(),
                key: "image.tag".to_string(),
                value: HelmImageValue::Tag,
                from_origin: Some(FreightOrigin::warehouse("images")),
            },
            HelmImageUpdate {
                repo_url: "ghcr.io/example/app".to_string(),
                key: "image.ref".to_string(),
                value: HelmImageValue::ImageAndDigest,
                from_origin: None,
            },
        ];
        let update = SourceUpdate {
            repo_url: source.repo_url.clone(),
            helm: Some(HelmUpdate { images }),
            ..SourceUpdate::default()
        };
        let collection = freight();
        let sources = build_desired_sources(
            &app(source),
            &[update],
            &[String::new()],
            FreightView {
                requests: &[],
                collection: &collection,
            },
        )
        .expect("build");

        let params = &sources[0].helm.as_ref().expect("helm").parameters;
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, "1.2.0");
        assert!(params[0].force_string);
        assert_eq!(params[1].name, "image.ref");
        assert_eq!(params[1].value, "ghcr.io/example/app@sha256:abc");
    }

    #[test]
    fn unmatched_update_is_terminal() {
        let collection = freight();
        let update = SourceUpdate {
            repo_url: "https://github.com/example/elsewhere".to_string(),
            ..SourceUpdate::default()
        };
        let err = build_desired_sources(
            &app(git_source()),
            &[update],
            &[String::new()],
            FreightView {
                requests: &[],
                collection: &collection,
            },
        )
        .expect_err("unmatched");
        assert!(is_terminal(&err));
    }

    #[test]
    fn ambiguous_images_need_an_origin() {
        let mut collection = freight();
        collection.insert(FreightReference {
            name: "f2".to_string(),
            origin: FreightOrigin::warehouse("mirror"),
            commits: Vec::new(),
            images: vec![Image {
                repo_url: "ghcr.io/example/app".to_string(),
                tag: "2.0.0".to_string(),
                digest: String::new(),
            }],
            charts: Vec::new(),
        });
        let view = FreightView {
            requests: &[],
            collection: &collection,
        };
        let err = view.find_image("ghcr.io/example/app", None).expect_err("ambiguous");
        assert!(err.to_string().contains("fromOrigin"), "{err}");

        let requests = vec![FreightRequest {
            origin: FreightOrigin::warehouse("mirror"),
        }];
        let narrowed = FreightView {
            requests: &requests,
            collection: &collection,
        };
        assert_eq!(narrowed.find_image("ghcr.io/example/app", None).expect("image").tag, "2.0.0");
    }
}
