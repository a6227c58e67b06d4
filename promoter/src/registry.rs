//! Step runner contracts and the registry mapping step kinds to runners.
//!
//! A registry is built once at startup and handed to the engine. Each
//! registration carries [`Permissions`] that decide which privileged clients
//! the engine injects into the runner's context.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::freight::{FreightCollection, FreightRequest};
use crate::core::policy::Cancellation;
use crate::core::state::State;
use crate::core::types::{HealthCheckStepResult, StepResult};
use crate::errors::RegistryError;
use crate::io::clients::{ArgoCdClient, CredentialsDatabase, KargoClient};
use crate::io::config::PromoterConfig;
use crate::io::schema::ConfigSchema;

/// Privileged clients a runner may receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub allow_kargo_client: bool,
    pub allow_argocd_client: bool,
    pub allow_credentials_db: bool,
}

/// Handles to the privileged collaborators.
#[derive(Clone, Default)]
pub struct Clients {
    pub kargo: Option<Arc<dyn KargoClient>>,
    pub argocd: Option<Arc<dyn ArgoCdClient>>,
    pub credentials: Option<Arc<dyn CredentialsDatabase>>,
}

impl fmt::Debug for Clients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clients")
            .field("kargo", &self.kargo.is_some())
            .field("argocd", &self.argocd.is_some())
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl Clients {
    /// The subset of clients a runner with `permissions` may see.
    pub fn authorized(&self, permissions: Permissions) -> Clients {
        Clients {
            kargo: self.kargo.clone().filter(|_| permissions.allow_kargo_client),
            argocd: self.argocd.clone().filter(|_| permissions.allow_argocd_client),
            credentials: self
                .credentials
                .clone()
                .filter(|_| permissions.allow_credentials_db),
        }
    }

    pub fn argocd(&self) -> Result<&dyn ArgoCdClient> {
        self.argocd
            .as_deref()
            .ok_or_else(|| anyhow!("Argo CD client is not available to this step"))
    }

    pub fn kargo(&self) -> Result<&dyn KargoClient> {
        self.kargo
            .as_deref()
            .ok_or_else(|| anyhow!("Kargo client is not available to this step"))
    }

    pub fn credentials(&self) -> Result<&dyn CredentialsDatabase> {
        self.credentials
            .as_deref()
            .ok_or_else(|| anyhow!("credentials database is not available to this step"))
    }
}

/// Everything a promotion step runner sees for one invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub work_dir: PathBuf,
    pub project: String,
    pub stage: String,
    pub promotion: String,
    pub alias: String,
    /// Configuration after expression resolution and schema validation.
    pub config: Value,
    /// Copy of the shared state; changes are not seen by other steps.
    pub shared_state: State,
    pub freight_requests: Vec<FreightRequest>,
    pub freight: FreightCollection,
    pub clients: Clients,
    pub cancellation: Cancellation,
}

/// Everything a health-check step runner sees for one invocation.
#[derive(Debug, Clone)]
pub struct HealthCheckContext {
    pub project: String,
    pub stage: String,
    pub config: Value,
    pub clients: Clients,
}

/// A step kind that can take part in a promotion.
pub trait PromotionStepRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the step. Returned errors count against the step's error budget
    /// unless they wrap a [`crate::errors::TerminalError`].
    ///
    /// An `Err` carries no output. A runner that must keep partial output
    /// across attempts (such as a retry counter) returns a
    /// [`StepStatus::Failed`](crate::core::types::StepStatus::Failed) result
    /// with that output instead.
    fn run(&self, ctx: &StepContext) -> Result<StepResult>;

    /// JSON Schema the step's configuration must satisfy.
    fn config_schema(&self) -> Option<Value> {
        None
    }

    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    fn default_error_threshold(&self) -> Option<u32> {
        None
    }
}

/// A step kind that can verify the health of a stage after promotion.
pub trait HealthCheckStepRunner: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, ctx: &HealthCheckContext) -> HealthCheckStepResult;
}

pub struct PromotionRegistration {
    pub runner: Arc<dyn PromotionStepRunner>,
    pub permissions: Permissions,
    pub schema: Option<ConfigSchema>,
}

pub struct HealthCheckRegistration {
    pub runner: Arc<dyn HealthCheckStepRunner>,
    pub permissions: Permissions,
}

/// Step kind → runner mapping.
#[derive(Default)]
pub struct Registry {
    promotion: BTreeMap<String, PromotionRegistration>,
    health: BTreeMap<String, HealthCheckRegistration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every step kind this crate provides.
    pub fn builtin(config: &PromoterConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        crate::argocd::register(&mut registry, &config.argocd)?;
        Ok(registry)
    }

    pub fn register_promotion_step_runner(
        &mut self,
        runner: Arc<dyn PromotionStepRunner>,
        permissions: Permissions,
    ) -> Result<(), RegistryError> {
        let kind = runner.name().to_string();
        if self.promotion.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered {
                role: "promotion step",
                kind,
            });
        }
        let schema = runner
            .config_schema()
            .map(ConfigSchema::compile)
            .transpose()
            .map_err(|err| RegistryError::InvalidSchema {
                kind: kind.clone(),
                reason: err.to_string(),
            })?;
        self.promotion.insert(
            kind,
            PromotionRegistration {
                runner,
                permissions,
                schema,
            },
        );
        Ok(())
    }

    pub fn register_health_check_step_runner(
        &mut self,
        runner: Arc<dyn HealthCheckStepRunner>,
        permissions: Permissions,
    ) -> Result<(), RegistryError> {
        let kind = runner.name().to_string();
        if self.health.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered {
                role: "health check",
                kind,
            });
        }
        self.health.insert(
            kind,
            HealthCheckRegistration {
                runner,
                permissions,
            },
        );
        Ok(())
    }

    pub fn promotion_step_runner(&self, kind: &str) -> Option<&PromotionRegistration> {
        self.promotion.get(kind)
    }

    pub fn health_check_step_runner(&self, kind: &str) -> Option<&HealthCheckRegistration> {
        self.health.get(kind)
    }

    pub fn promotion_kinds(&self) -> impl Iterator<Item = &str> {
        self.promotion.keys().map(String::as_str)
    }

    pub fn health_check_kinds(&self) -> impl Iterator<Item = &str> {
        self.health.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{HealthState, StepResult};
    use serde_json::json;

    struct Noop;

    impl PromotionStepRunner for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _ctx: &StepContext) -> Result<StepResult> {
            Ok(StepResult::succeeded())
        }
    }

    impl HealthCheckStepRunner for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn check(&self, _ctx: &HealthCheckContext) -> HealthCheckStepResult {
            HealthCheckStepResult::new(HealthState::Healthy)
        }
    }

    struct BadSchema;

    impl PromotionStepRunner for BadSchema {
        fn name(&self) -> &str {
            "bad-schema"
        }

        fn run(&self, _ctx: &StepContext) -> Result<StepResult> {
            Ok(StepResult::succeeded())
        }

        fn config_schema(&self) -> Option<Value> {
            Some(json!({"type": "not-a-type"}))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register_promotion_step_runner(Arc::new(Noop), Permissions::default())
            .expect("first");
        let err = registry
            .register_promotion_step_runner(Arc::new(Noop), Permissions::default())
            .expect_err("second");
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn promotion_and_health_roles_are_separate() {
        let mut registry = Registry::new();
        registry
            .register_promotion_step_runner(Arc::new(Noop), Permissions::default())
            .expect("promotion");
        assert!(registry.health_check_step_runner("noop").is_none());
        registry
            .register_health_check_step_runner(Arc::new(Noop), Permissions::default())
            .expect("health");
        assert!(registry.health_check_step_runner("noop").is_some());
        assert_eq!(registry.promotion_kinds().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn invalid_schema_fails_registration() {
        let mut registry = Registry::new();
        let err = registry
            .register_promotion_step_runner(Arc::new(BadSchema), Permissions::default())
            .expect_err("schema");
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
    }

    #[test]
    fn builtin_registry_provides_argocd_update() {
        let registry = Registry::builtin(&PromoterConfig::default()).expect("builtin");
        assert_eq!(registry.promotion_kinds().collect::<Vec<_>>(), vec!["argocd-update"]);
        assert_eq!(registry.health_check_kinds().collect::<Vec<_>>(), vec!["argocd-update"]);
    }

    #[test]
    fn clients_are_filtered_by_permissions() {
        struct NoSecrets;
        impl KargoClient for NoSecrets {
            fn project_secrets(
                &self,
                _project: &str,
            ) -> Result<crate::io::expressions::ProjectSecrets> {
                Ok(Default::default())
            }
        }

        let clients = Clients {
            kargo: Some(Arc::new(NoSecrets)),
            ..Clients::default()
        };
        assert!(clients.authorized(Permissions::default()).kargo.is_none());
        let granted = clients.authorized(Permissions {
            allow_kargo_client: true,
            ..Permissions::default()
        });
        assert!(granted.kargo().is_ok());
        assert!(granted.argocd().is_err());
    }
}
