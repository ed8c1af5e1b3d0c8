// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable workflow runtime.
//!
//! [`WorkflowRuntime`] coordinates definitions, instances and bookmarks over
//! three [`Store`]s and hands executable graphs to the [`Scheduler`]. It owns
//! every rule that needs more than one entity: version resolution, the
//! latest/published flags, singleton enforcement, exclusive bookmark claims and
//! retention of terminal instances.
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{StartWorkflowParams, WorkflowRuntime};
//! use trellis_core::persistence::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::from_path(".data/trellis.db").await?;
//!     let runtime = WorkflowRuntime::builder().sqlite(store).build()?;
//!
//!     let result = runtime
//!         .start_workflow(StartWorkflowParams::new("order-approval"))
//!         .await?;
//!     println!("{} is {}", result.instance_id, result.status);
//!     Ok(())
//! }
//! ```
//!
//! # Exclusive access
//!
//! A bookmark is claimed by deleting its index entry; only the request whose
//! delete removed the row proceeds. The claimed instance is then moved from
//! `Suspended` to `Running` with a compare-and-swap save, so two requests that
//! claim different bookmarks of the same instance cannot both run it. A request
//! that loses the instance race puts its bookmark back and fails with
//! [`CoreError::InstanceBusy`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use trellis_dsl::{
    ActivityDefinition, SaveWorkflowDefinition, VersionOptions, WorkflowDefinition,
    WorkflowPersistenceBehavior,
};
use uuid::Uuid;

use crate::activity::ActivityRegistry;
use crate::cancellation::CancellationTokens;
use crate::config::Config;
use crate::definitions::{resolve_version, version_id};
use crate::error::{CoreError, Result};
use crate::graph::ExecutableGraph;
use crate::instance::{Bookmark, ScheduledActivity, WorkflowInstance, WorkflowStatus, payload_hash};
use crate::params::{
    CancelOutcome, ResumeWorkflowParams, StartWorkflowParams, WorkflowExecutionResult,
};
use crate::persistence::{MemoryStore, SqliteStore, Store};
use crate::scheduler::{self, Scheduler, StepObserver};
use crate::specification::{Entity, OrderBy, Page, Specification, fields};
use crate::validation::{self, ValidationResult};

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`WorkflowRuntime`].
pub struct WorkflowRuntimeBuilder {
    definitions: Option<Arc<dyn Store<WorkflowDefinition>>>,
    instances: Option<Arc<dyn Store<WorkflowInstance>>>,
    bookmarks: Option<Arc<dyn Store<Bookmark>>>,
    registry: Option<ActivityRegistry>,
    max_concurrent_runs: usize,
    max_steps_per_run: u64,
}

impl std::fmt::Debug for WorkflowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntimeBuilder")
            .field("definitions", &self.definitions.as_ref().map(|_| "..."))
            .field("instances", &self.instances.as_ref().map(|_| "..."))
            .field("bookmarks", &self.bookmarks.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("max_steps_per_run", &self.max_steps_per_run)
            .finish()
    }
}

impl Default for WorkflowRuntimeBuilder {
    fn default() -> Self {
        let config = Config::default();
        Self {
            definitions: None,
            instances: None,
            bookmarks: None,
            registry: None,
            max_concurrent_runs: config.max_concurrent_runs,
            max_steps_per_run: config.max_steps_per_run,
        }
    }
}

impl WorkflowRuntimeBuilder {
    /// Create a new builder with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the definition store (required).
    pub fn definitions(mut self, store: Arc<dyn Store<WorkflowDefinition>>) -> Self {
        self.definitions = Some(store);
        self
    }

    /// Set the instance store (required).
    pub fn instances(mut self, store: Arc<dyn Store<WorkflowInstance>>) -> Self {
        self.instances = Some(store);
        self
    }

    /// Set the bookmark index store (required).
    pub fn bookmarks(mut self, store: Arc<dyn Store<Bookmark>>) -> Self {
        self.bookmarks = Some(store);
        self
    }

    /// Use one SQLite database for all three stores.
    pub fn sqlite(self, store: SqliteStore) -> Self {
        let store = Arc::new(store);
        self.definitions(store.clone())
            .instances(store.clone())
            .bookmarks(store)
    }

    /// Use fresh in-memory stores.
    pub fn in_memory(self) -> Self {
        self.definitions(Arc::new(MemoryStore::<WorkflowDefinition>::new()))
            .instances(Arc::new(MemoryStore::<WorkflowInstance>::new()))
            .bookmarks(Arc::new(MemoryStore::<Bookmark>::new()))
    }

    /// Set the activity registry.
    ///
    /// Default: [`ActivityRegistry::with_builtins`]
    pub fn registry(mut self, registry: ActivityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Take limits from a [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.max_concurrent_runs(config.max_concurrent_runs)
            .max_steps_per_run(config.max_steps_per_run)
    }

    /// Maximum scheduler runs executing at once.
    ///
    /// Default: 32
    pub fn max_concurrent_runs(mut self, n: usize) -> Self {
        self.max_concurrent_runs = n;
        self
    }

    /// Step budget per scheduler run.
    ///
    /// Default: 10000
    pub fn max_steps_per_run(mut self, n: u64) -> Self {
        self.max_steps_per_run = n;
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if a store is missing or a limit is zero.
    pub fn build(self) -> Result<WorkflowRuntime> {
        let missing = |what: &str| CoreError::Configuration {
            message: format!("{} store is required", what),
        };
        let definitions = self.definitions.ok_or_else(|| missing("definition"))?;
        let instances = self.instances.ok_or_else(|| missing("instance"))?;
        let bookmarks = self.bookmarks.ok_or_else(|| missing("bookmark"))?;

        if self.max_concurrent_runs == 0 || self.max_steps_per_run == 0 {
            return Err(CoreError::Configuration {
                message: "run limits must be positive".to_string(),
            });
        }

        Ok(WorkflowRuntime {
            definitions,
            instances,
            bookmarks,
            registry: Arc::new(
                self.registry
                    .unwrap_or_else(ActivityRegistry::with_builtins),
            ),
            graphs: RwLock::new(HashMap::new()),
            definition_locks: KeyedLocks::default(),
            singleton_locks: KeyedLocks::default(),
            running: Arc::new(Mutex::new(HashMap::new())),
            permits: Semaphore::new(self.max_concurrent_runs),
            max_steps_per_run: self.max_steps_per_run,
        })
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Async mutexes keyed by string, created on first use.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

type RunningRuns = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Removes an instance from the running set when its run ends.
struct RunRegistration {
    running: RunningRuns,
    instance_id: String,
}

impl RunRegistration {
    /// Mark `instance_id` as running in this process; `None` if it already is.
    fn register(
        running: &RunningRuns,
        instance_id: &str,
        tokens: &CancellationTokens,
    ) -> Option<Self> {
        let mut runs = running.lock();
        if runs.contains_key(instance_id) {
            return None;
        }
        runs.insert(instance_id.to_string(), tokens.system.clone());
        Some(Self {
            running: running.clone(),
            instance_id: instance_id.to_string(),
        })
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.running.lock().remove(&self.instance_id);
    }
}

/// Saves the instance after a step when its definition asks for it.
struct Checkpoint<'a> {
    store: &'a dyn Store<WorkflowInstance>,
    behavior: WorkflowPersistenceBehavior,
}

#[async_trait]
impl StepObserver for Checkpoint<'_> {
    async fn after_step(
        &mut self,
        instance: &mut WorkflowInstance,
        activity: &ActivityDefinition,
    ) -> Result<()> {
        if self.behavior == WorkflowPersistenceBehavior::Always || activity.persist_workflow {
            self.store.save(instance).await?;
            debug!(
                instance_id = %instance.id,
                activity_id = %activity.activity_id,
                "Checkpoint saved"
            );
        }
        Ok(())
    }
}

/// The persistence coordinator and entry point for every operation.
pub struct WorkflowRuntime {
    definitions: Arc<dyn Store<WorkflowDefinition>>,
    instances: Arc<dyn Store<WorkflowInstance>>,
    bookmarks: Arc<dyn Store<Bookmark>>,
    registry: Arc<ActivityRegistry>,
    graphs: RwLock<HashMap<(String, u64), Arc<ExecutableGraph>>>,
    definition_locks: KeyedLocks,
    singleton_locks: KeyedLocks,
    running: RunningRuns,
    permits: Semaphore,
    max_steps_per_run: u64,
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("stores", &"...")
            .field("registry", &self.registry)
            .field("running", &self.running.lock().len())
            .field("max_steps_per_run", &self.max_steps_per_run)
            .finish()
    }
}

impl WorkflowRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::new()
    }

    /// The activity registry graphs are resolved against.
    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Instances with a scheduler run in progress in this process.
    pub fn running_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Save a designer request.
    ///
    /// Edits the latest version in place while it is an unpublished draft that
    /// no idle, running or suspended instance uses; otherwise creates version
    /// `latest + 1`. With `publish` set, the saved
    /// version becomes the published one. Nothing is written if validation fails.
    #[instrument(skip(self, request), fields(definition_id))]
    pub async fn save_definition(
        &self,
        request: SaveWorkflowDefinition,
    ) -> Result<WorkflowDefinition> {
        let definition_id = request
            .workflow_definition_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("definition_id", definition_id.as_str());

        let _guard = self.definition_locks.lock(&definition_id).await;
        let mut family = self.load_family(&definition_id).await?;
        let original: Vec<(bool, bool)> = family
            .iter()
            .map(|d| (d.is_latest, d.is_published))
            .collect();

        let editable = match family.iter().position(|d| d.is_latest) {
            Some(i) if !family[i].is_published => {
                let active = self
                    .instances
                    .count(
                        &Specification::field_eq(
                            "definition_version_id",
                            family[i].definition_version_id.as_str(),
                        )
                        .and(Specification::non_terminal()),
                    )
                    .await?;
                if active > 0 {
                    info!(
                        version = family[i].version,
                        active, "Draft has live instances; saving a new version"
                    );
                }
                (active == 0).then_some(i)
            }
            _ => None,
        };
        let draft_index = match editable {
            Some(i) => i,
            None => {
                let version = family.iter().map(|d| d.version).max().unwrap_or(0) + 1;
                let mut draft =
                    WorkflowDefinition::new(definition_id.clone(), version_id(&definition_id, version));
                draft.version = version;
                for d in family.iter_mut() {
                    d.is_latest = false;
                }
                family.push(draft);
                family.len() - 1
            }
        };

        request.apply_to(&mut family[draft_index]);
        family[draft_index].is_latest = true;
        if request.publish {
            for d in family.iter_mut() {
                d.is_published = false;
            }
            family[draft_index].is_published = true;
        }

        let mut result = validation::validate_definition(&family[draft_index], &self.registry);
        result.merge(validation::validate_family(&definition_id, &family));
        into_result(result)?;

        // Demote first so a crash never leaves two latest or two published versions.
        for (i, d) in family.iter_mut().enumerate() {
            let changed = original
                .get(i)
                .is_some_and(|before| *before != (d.is_latest, d.is_published));
            if i != draft_index && changed {
                self.definitions.save(d).await?;
            }
        }
        let draft = &mut family[draft_index];
        self.definitions.save(draft).await?;
        self.evict_graphs(&draft.definition_version_id);

        info!(
            version = draft.version,
            published = draft.is_published,
            "Definition saved"
        );
        Ok(draft.clone())
    }

    /// Publish the latest version, unpublishing the previously published one.
    #[instrument(skip(self))]
    pub async fn publish(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        let _guard = self.definition_locks.lock(definition_id).await;
        let mut family = self.load_family(definition_id).await?;

        let Some(latest) = family.iter().position(|d| d.is_latest) else {
            return Err(CoreError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
                selector: VersionOptions::Latest.to_string(),
            });
        };
        if family[latest].is_published {
            warn!(version = family[latest].version, "Latest version is already published");
            return Err(CoreError::DuplicatePublish {
                definition_id: definition_id.to_string(),
                version: family[latest].version,
            });
        }

        let previous = family.iter().position(|d| d.is_published);
        if let Some(p) = previous {
            family[p].is_published = false;
        }
        family[latest].is_published = true;

        let mut result = validation::validate_definition(&family[latest], &self.registry);
        result.merge(validation::validate_family(definition_id, &family));
        into_result(result)?;

        if let Some(p) = previous {
            self.definitions.save(&mut family[p]).await?;
        }
        let published = &mut family[latest];
        self.definitions.save(published).await?;

        info!(version = published.version, "Definition published");
        Ok(published.clone())
    }

    /// Clear the published flag. The family then starts from its latest version.
    #[instrument(skip(self))]
    pub async fn retract(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        let _guard = self.definition_locks.lock(definition_id).await;
        let mut family = self.load_family(definition_id).await?;

        let Some(published) = family.iter_mut().find(|d| d.is_published) else {
            return Err(CoreError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
                selector: VersionOptions::Published.to_string(),
            });
        };
        published.is_published = false;
        self.definitions.save(published).await?;

        info!(version = published.version, "Definition retracted");
        Ok(published.clone())
    }

    /// Delete every version of a definition. Returns how many versions were removed.
    ///
    /// Existing instances are kept; they can no longer be resumed.
    #[instrument(skip(self))]
    pub async fn delete_definition(&self, definition_id: &str) -> Result<u64> {
        let _guard = self.definition_locks.lock(definition_id).await;
        let family = self.load_family(definition_id).await?;
        let removed = self
            .definitions
            .delete(&Specification::by_definition(definition_id))
            .await?;
        if removed == 0 {
            return Err(CoreError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
                selector: VersionOptions::All.to_string(),
            });
        }
        for d in &family {
            self.evict_graphs(&d.definition_version_id);
        }

        info!(removed, "Definition deleted");
        Ok(removed)
    }

    /// Resolve a version selector to one definition version.
    #[instrument(skip(self))]
    pub async fn get_definition(
        &self,
        definition_id: &str,
        version: VersionOptions,
    ) -> Result<WorkflowDefinition> {
        let candidates = self
            .definitions
            .find_many(
                &Specification::ByDefinitionId {
                    definition_id: definition_id.to_string(),
                    version: Some(version),
                },
                Some(&OrderBy::asc(fields::VERSION)),
                None,
            )
            .await?;
        resolve_version(&candidates, version)
            .cloned()
            .ok_or_else(|| CoreError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
                selector: version.to_string(),
            })
    }

    /// Query definition versions.
    pub async fn find_definitions(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<WorkflowDefinition>> {
        self.definitions.find_many(spec, order_by, page).await
    }

    async fn load_family(&self, definition_id: &str) -> Result<Vec<WorkflowDefinition>> {
        self.definitions
            .find_many(
                &Specification::by_definition(definition_id),
                Some(&OrderBy::asc(fields::VERSION)),
                None,
            )
            .await
    }

    fn graph_for(&self, definition: &WorkflowDefinition) -> Result<Arc<ExecutableGraph>> {
        let key = (definition.definition_version_id.clone(), definition.revision());
        if let Some(graph) = self.graphs.read().get(&key) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(ExecutableGraph::load(definition, &self.registry)?);
        self.graphs.write().insert(key, graph.clone());
        debug!(
            definition_version_id = %definition.definition_version_id,
            "Graph loaded"
        );
        Ok(graph)
    }

    fn evict_graphs(&self, definition_version_id: &str) {
        self.graphs
            .write()
            .retain(|(id, _), _| id != definition_version_id);
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Start an instance and run it until it suspends or ends.
    ///
    /// With a caller-supplied `instance_id` that already exists, nothing runs
    /// and the existing instance's state is returned.
    #[instrument(skip(self, params), fields(definition_id = %params.definition_id))]
    pub async fn start_workflow(
        &self,
        params: StartWorkflowParams,
    ) -> Result<WorkflowExecutionResult> {
        let tokens = params.cancellation.scoped();

        // Held until the instance is stored so a draft cannot be edited under it.
        let (instance, definition, graph, registration) = {
            let _definition = self.definition_locks.lock(&params.definition_id).await;
            let definition = self
                .get_definition(&params.definition_id, params.version)
                .await?;
            if !definition.is_enabled {
                warn!("Start rejected: definition disabled");
                return Err(CoreError::DefinitionDisabled {
                    definition_id: definition.id.clone(),
                });
            }
            let graph = self.graph_for(&definition)?;

            if let Some(id) = &params.instance_id
                && let Some(existing) = self.instances.get(id).await?
            {
                return existing_start(existing, &definition);
            }

            let instance_id = params
                .instance_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut instance = WorkflowInstance::new(
                instance_id.clone(),
                &definition,
                params.correlation_id.clone(),
                params.input.clone(),
                params.properties.clone(),
            );

            match &params.trigger_activity_id {
                Some(activity_id) => {
                    if !graph.contains(activity_id) {
                        return Err(CoreError::ActivityNotFound {
                            definition_version_id: definition.definition_version_id.clone(),
                            activity_id: activity_id.clone(),
                        });
                    }
                    let trigger = Value::Object(params.input.clone().into_iter().collect());
                    instance.schedule(ScheduledActivity::triggered(activity_id.clone(), trigger));
                }
                None => {
                    for activity_id in graph.start_activities() {
                        instance.schedule(ScheduledActivity::new(activity_id.clone()));
                    }
                }
            }
            instance.transition(WorkflowStatus::Running)?;

            // Registered before the `Running` save, so a stored `Running` record
            // with no registration is an interrupted run.
            let registration = self.register_run(&instance_id, &tokens)?;

            let _singleton = match definition.is_singleton {
                true => Some(self.singleton_locks.lock(&definition.id).await),
                false => None,
            };
            if definition.is_singleton
                && let Some(existing) = self
                    .instances
                    .find(&Specification::by_definition(&definition.id).and(Specification::non_terminal()))
                    .await?
            {
                warn!(existing_instance_id = %existing.id, "Start rejected: singleton occupied");
                return Err(CoreError::SingletonViolation {
                    definition_id: definition.id.clone(),
                    existing_instance_id: existing.id,
                });
            }

            match self.instances.save(&mut instance).await {
                Ok(()) => {}
                Err(CoreError::DuplicateEntity { .. }) => {
                    drop(registration);
                    let existing = self.instances.get(&instance_id).await?.ok_or_else(|| {
                        CoreError::InstanceNotFound {
                            instance_id: instance_id.clone(),
                        }
                    })?;
                    return existing_start(existing, &definition);
                }
                Err(e) => return Err(e),
            }
            (instance, definition, graph, registration)
        };

        info!(
            instance_id = %instance.id,
            version = definition.version,
            "Instance started"
        );
        self.execute(instance, &definition, graph, tokens, registration)
            .await
    }

    /// Resume the oldest bookmark matching the request.
    ///
    /// Fails with [`CoreError::BookmarkNotFound`] when nothing matches and with
    /// [`CoreError::AlreadyResumed`] when every match was claimed concurrently.
    #[instrument(skip(self, params), fields(activity_id = %params.activity_id))]
    pub async fn resume(&self, params: ResumeWorkflowParams) -> Result<WorkflowExecutionResult> {
        let mut spec = Specification::field_eq("activity_id", params.activity_id.as_str())
            .and(Specification::field_eq(
                "payload_hash",
                payload_hash(&params.payload),
            ));
        if let Some(correlation_id) = &params.correlation_id {
            spec = spec.and(Specification::ByCorrelationId(correlation_id.clone()));
        }
        if let Some(instance_id) = &params.instance_id {
            spec = spec.and(Specification::field_eq("instance_id", instance_id.as_str()));
        }

        let candidates = self
            .bookmarks
            .find_many(&spec, Some(&OrderBy::asc(fields::CREATED_AT)), None)
            .await?;

        let mut outcome = Err(CoreError::BookmarkNotFound {
            criteria: format!(
                "activity '{}' with payload {}",
                params.activity_id, params.payload
            ),
        });
        for bookmark in candidates
            .into_iter()
            .filter(|b| b.payload == params.payload)
        {
            outcome = self
                .claim_and_resume(bookmark, params.input.clone(), &params.cancellation)
                .await;
            match &outcome {
                Err(CoreError::AlreadyResumed { .. }) | Err(CoreError::BookmarkNotFound { .. }) => {
                    continue;
                }
                _ => break,
            }
        }
        outcome
    }

    /// Resume one bookmark by id.
    #[instrument(skip(self, input, cancellation))]
    pub async fn resume_bookmark(
        &self,
        bookmark_id: &str,
        input: BTreeMap<String, Value>,
        cancellation: CancellationTokens,
    ) -> Result<WorkflowExecutionResult> {
        let bookmark =
            self.bookmarks
                .get(bookmark_id)
                .await?
                .ok_or_else(|| CoreError::BookmarkNotFound {
                    criteria: format!("id '{}'", bookmark_id),
                })?;
        self.claim_and_resume(bookmark, input, &cancellation).await
    }

    /// Resume every bookmark created by an activity of `activity_type` whose
    /// payload equals `payload`, one result per resumed bookmark.
    ///
    /// Bookmarks claimed by someone else in the meantime are skipped.
    #[instrument(skip(self, payload, input))]
    pub async fn dispatch_trigger(
        &self,
        activity_type: &str,
        payload: &Value,
        correlation_id: Option<&str>,
        input: BTreeMap<String, Value>,
    ) -> Result<Vec<WorkflowExecutionResult>> {
        let mut spec = Specification::field_eq("activity_type", activity_type)
            .and(Specification::field_eq("payload_hash", payload_hash(payload)));
        if let Some(correlation_id) = correlation_id {
            spec = spec.and(Specification::ByCorrelationId(correlation_id.to_string()));
        }
        let candidates = self
            .bookmarks
            .find_many(&spec, Some(&OrderBy::asc(fields::CREATED_AT)), None)
            .await?;

        let mut results = Vec::new();
        for bookmark in candidates.into_iter().filter(|b| b.payload == *payload) {
            match self
                .claim_and_resume(bookmark, input.clone(), &CancellationTokens::new())
                .await
            {
                Ok(result) => results.push(result),
                Err(
                    e @ (CoreError::AlreadyResumed { .. }
                    | CoreError::BookmarkNotFound { .. }
                    | CoreError::InstanceBusy { .. }),
                ) => debug!(error = %e, "Skipping bookmark"),
                Err(e) => return Err(e),
            }
        }
        info!(resumed = results.len(), "Trigger dispatched");
        Ok(results)
    }

    /// Run an interrupted instance again from its stored state.
    ///
    /// An instance stored as `Running` with no run in this process was cut off
    /// mid-run: the caller dropped the future, the process exited, or a save
    /// failed and could not be rolled forward. Its stored frontier runs again,
    /// so activities executed after the last checkpoint execute a second time.
    #[instrument(skip(self, cancellation))]
    pub async fn recover_instance(
        &self,
        instance_id: &str,
        cancellation: CancellationTokens,
    ) -> Result<WorkflowExecutionResult> {
        let tokens = cancellation.scoped();
        let registration = self.register_run(instance_id, &tokens)?;

        let mut instance = self.require_instance(instance_id).await?;
        if instance.status() != WorkflowStatus::Running {
            return Err(CoreError::InvalidTransition {
                instance_id: instance.id.clone(),
                from: instance.status().to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }
        let definition = self
            .definitions
            .get(&instance.definition_version_id)
            .await?
            .ok_or_else(|| CoreError::DefinitionNotFound {
                definition_id: instance.definition_id.clone(),
                selector: VersionOptions::SpecificVersion(instance.version).to_string(),
            })?;
        let graph = self.graph_for(&definition)?;

        // A checkpoint may have stored bookmarks the interrupted run never indexed.
        for bookmark in instance.bookmarks() {
            if self.bookmarks.get(&bookmark.id).await?.is_none() {
                self.bookmarks.save(&mut bookmark.reindexed()).await?;
            }
        }

        // Claim it against a concurrent cancel.
        if let Err(e) = self.instances.save(&mut instance).await {
            if e.is_conflict() {
                return Err(CoreError::InstanceBusy {
                    instance_id: instance.id,
                });
            }
            return Err(e);
        }

        info!(
            frontier = instance.frontier().count(),
            "Interrupted instance recovered"
        );
        self.execute(instance, &definition, graph, tokens, registration)
            .await
    }

    /// Recover every interrupted instance, oldest first.
    ///
    /// Meant for process startup. Instances that finish, get cancelled or get
    /// picked up by another caller in the meantime are skipped.
    #[instrument(skip(self, cancellation))]
    pub async fn recover_instances(
        &self,
        cancellation: CancellationTokens,
    ) -> Result<Vec<WorkflowExecutionResult>> {
        let candidates = self
            .instances
            .find_many(
                &Specification::with_status(WorkflowStatus::Running),
                Some(&OrderBy::asc(fields::CREATED_AT)),
                None,
            )
            .await?;

        let mut results = Vec::new();
        for instance in candidates {
            match self.recover_instance(&instance.id, cancellation.clone()).await {
                Ok(result) => results.push(result),
                Err(
                    e @ (CoreError::InstanceBusy { .. }
                    | CoreError::InstanceNotFound { .. }
                    | CoreError::InvalidTransition { .. }),
                ) => debug!(instance_id = %instance.id, error = %e, "Skipping instance"),
                Err(e) => return Err(e),
            }
        }
        info!(recovered = results.len(), "Recovery complete");
        Ok(results)
    }

    /// Cancel an instance.
    ///
    /// Idle and suspended instances are cancelled at once, as are `Running`
    /// instances whose run was interrupted. An instance running in this process
    /// is cancelled at its next step boundary.
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, instance_id: &str) -> Result<CancelOutcome> {
        if self.request_cancel(instance_id) {
            return Ok(CancelOutcome::Requested);
        }

        let mut instance = self.require_instance(instance_id).await?;
        if instance.status() == WorkflowStatus::Running {
            // Runs register before storing `Running`; checking again catches one
            // that started after the first look.
            if self.request_cancel(instance_id) {
                return Ok(CancelOutcome::Requested);
            }
            warn!("Cancelling interrupted run");
        }
        instance.transition(WorkflowStatus::Cancelled)?;
        instance.drain_frontier();
        instance.clear_bookmarks();

        let retain = self
            .definitions
            .get(&instance.definition_version_id)
            .await?
            .is_none_or(|d| retains_terminal(&d));
        match self.commit(&mut instance, retain).await {
            Err(e) if e.is_conflict() => Err(CoreError::InstanceBusy {
                instance_id: instance_id.to_string(),
            }),
            Err(e) => Err(e),
            Ok(()) => {
                info!("Instance cancelled");
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    /// Cancel the run registered for `instance_id`, if there is one.
    fn request_cancel(&self, instance_id: &str) -> bool {
        let token = self.running.lock().get(instance_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                info!("Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Delete an instance and its bookmarks.
    #[instrument(skip(self))]
    pub async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let running = self.running.lock().contains_key(instance_id);
        if running {
            return Err(CoreError::InstanceBusy {
                instance_id: instance_id.to_string(),
            });
        }
        let removed = self
            .instances
            .delete(&Specification::ById(instance_id.to_string()))
            .await?;
        if removed == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        self.bookmarks
            .delete(&Specification::field_eq("instance_id", instance_id))
            .await?;
        info!("Instance deleted");
        Ok(())
    }

    /// Load an instance.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        self.instances.get(instance_id).await
    }

    /// Query instances.
    pub async fn find_instances(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<WorkflowInstance>> {
        self.instances.find_many(spec, order_by, page).await
    }

    /// Count instances.
    pub async fn count_instances(&self, spec: &Specification) -> Result<u64> {
        self.instances.count(spec).await
    }

    /// Query the bookmark index.
    pub async fn find_bookmarks(
        &self,
        spec: &Specification,
        order_by: Option<&OrderBy>,
        page: Option<Page>,
    ) -> Result<Vec<Bookmark>> {
        self.bookmarks.find_many(spec, order_by, page).await
    }

    fn register_run(
        &self,
        instance_id: &str,
        tokens: &CancellationTokens,
    ) -> Result<RunRegistration> {
        RunRegistration::register(&self.running, instance_id, tokens).ok_or_else(|| {
            CoreError::InstanceBusy {
                instance_id: instance_id.to_string(),
            }
        })
    }

    async fn require_instance(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn claim_and_resume(
        &self,
        bookmark: Bookmark,
        input: BTreeMap<String, Value>,
        cancellation: &CancellationTokens,
    ) -> Result<WorkflowExecutionResult> {
        let claimed = self
            .bookmarks
            .delete(&Specification::ById(bookmark.id.clone()))
            .await?;
        if claimed == 0 {
            debug!(bookmark_id = %bookmark.id, "Bookmark already claimed");
            return Err(CoreError::AlreadyResumed {
                bookmark_id: bookmark.id,
            });
        }

        let stale = || CoreError::BookmarkNotFound {
            criteria: format!("id '{}'", bookmark.id),
        };
        let Some(mut instance) = self.instances.get(&bookmark.instance_id).await? else {
            debug!(bookmark_id = %bookmark.id, "Dropped stale bookmark entry");
            return Err(stale());
        };

        // A stored `Running` instance with no live run was interrupted; it goes
        // through `recover_instance`, not a bookmark.
        let tokens = cancellation.scoped();
        let registration = RunRegistration::register(&self.running, &instance.id, &tokens)
            .filter(|_| instance.status() != WorkflowStatus::Running);
        let Some(registration) = registration else {
            self.restore_index(&bookmark).await?;
            warn!(instance_id = %instance.id, "Resume rejected: instance running");
            return Err(CoreError::InstanceBusy {
                instance_id: instance.id,
            });
        };
        if instance.take_bookmark(&bookmark.id).is_none() {
            debug!(bookmark_id = %bookmark.id, "Dropped stale bookmark entry");
            return Err(stale());
        }

        let definition = match self.definitions.get(&instance.definition_version_id).await? {
            Some(definition) => definition,
            None => {
                self.restore_index(&bookmark).await?;
                return Err(CoreError::DefinitionNotFound {
                    definition_id: instance.definition_id.clone(),
                    selector: VersionOptions::SpecificVersion(instance.version).to_string(),
                });
            }
        };
        let graph = match self.graph_for(&definition) {
            Ok(graph) => graph,
            Err(e) => {
                self.restore_index(&bookmark).await?;
                return Err(e);
            }
        };

        instance.transition(WorkflowStatus::Running)?;
        let trigger = Value::Object(input.into_iter().collect());
        instance.schedule(ScheduledActivity::triggered(
            bookmark.activity_id.clone(),
            trigger,
        ));
        if let Err(e) = self.instances.save(&mut instance).await {
            if e.is_conflict() {
                self.restore_index(&bookmark).await?;
                warn!(instance_id = %instance.id, "Resume rejected: concurrent update");
                return Err(CoreError::InstanceBusy {
                    instance_id: instance.id,
                });
            }
            return Err(e);
        }

        info!(
            instance_id = %instance.id,
            bookmark_id = %bookmark.id,
            "Instance resumed"
        );
        self.execute(instance, &definition, graph, tokens, registration)
            .await
    }

    async fn restore_index(&self, bookmark: &Bookmark) -> Result<()> {
        self.bookmarks.save(&mut bookmark.reindexed()).await
    }

    async fn execute(
        &self,
        mut instance: WorkflowInstance,
        definition: &WorkflowDefinition,
        graph: Arc<ExecutableGraph>,
        tokens: CancellationTokens,
        _registration: RunRegistration,
    ) -> Result<WorkflowExecutionResult> {
        match self.drive(&mut instance, definition, &graph, &tokens).await {
            Ok(()) => Ok(WorkflowExecutionResult::from(&instance)),
            Err(e) => {
                self.abandon_run(&instance.id, definition, &graph, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        graph: &ExecutableGraph,
        tokens: &CancellationTokens,
    ) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CoreError::Configuration {
                message: "run limiter closed".to_string(),
            })?;

        let mut checkpoint = Checkpoint {
            store: self.instances.as_ref(),
            behavior: definition.persistence_behavior,
        };
        let summary = Scheduler::new(graph, self.max_steps_per_run)
            .run(instance, tokens, &mut checkpoint)
            .await?;

        // The index must never miss a bookmark the saved instance holds.
        for bookmark in &summary.created_bookmarks {
            self.bookmarks.save(&mut bookmark.reindexed()).await?;
        }
        self.commit(instance, retains_terminal(definition)).await?;

        debug!(
            instance_id = %instance.id,
            steps = summary.steps,
            dropped_bookmarks = summary.dropped_bookmarks.len(),
            status = %instance.status(),
            "Run complete"
        );
        Ok(())
    }

    /// Fault an instance whose run failed before its result was stored.
    ///
    /// Works from the stored copy, which may be behind the one in memory. When
    /// the store keeps failing the record stays `Running`, where
    /// [`recover_instance`](Self::recover_instance) and
    /// [`cancel_instance`](Self::cancel_instance) can still reach it.
    async fn abandon_run(
        &self,
        instance_id: &str,
        definition: &WorkflowDefinition,
        graph: &ExecutableGraph,
        cause: &CoreError,
    ) {
        let mut stored = match self.instances.get(instance_id).await {
            Ok(Some(stored)) if stored.status() == WorkflowStatus::Running => stored,
            Ok(_) => return,
            Err(e) => {
                error!(instance_id, error = %e, "Instance left running after failed run");
                return;
            }
        };

        let activity_id = stored
            .frontier()
            .next()
            .map(|a| a.activity_id.clone())
            .unwrap_or_default();
        let activity_type = graph
            .node(&activity_id)
            .map(|n| n.definition.activity_type.clone())
            .unwrap_or_default();
        let message = format!("run aborted: {}", cause);
        let faulted = scheduler::fault(&mut stored, &activity_id, &activity_type, message, false);
        if let Err(e) = faulted {
            error!(instance_id, error = %e, "Instance left running after failed run");
            return;
        }
        match self.commit(&mut stored, retains_terminal(definition)).await {
            Ok(()) => warn!(instance_id, error = %cause, "Run failed; instance faulted"),
            Err(e) => error!(instance_id, error = %e, "Instance left running after failed run"),
        }
    }

    /// Save the instance; terminal instances also lose their bookmark index
    /// entries and, unless retained, their record.
    async fn commit(&self, instance: &mut WorkflowInstance, retain_terminal: bool) -> Result<()> {
        self.instances.save(instance).await?;
        if !instance.status().is_terminal() {
            return Ok(());
        }

        self.bookmarks
            .delete(&Specification::field_eq("instance_id", instance.id.as_str()))
            .await?;
        if !retain_terminal {
            self.instances
                .delete(&Specification::ById(instance.id.clone()))
                .await?;
            debug!(instance_id = %instance.id, "Terminal instance removed");
        }
        Ok(())
    }
}

fn retains_terminal(definition: &WorkflowDefinition) -> bool {
    !definition.delete_completed_instances
        && definition.persistence_behavior != WorkflowPersistenceBehavior::Never
}

fn existing_start(
    existing: WorkflowInstance,
    definition: &WorkflowDefinition,
) -> Result<WorkflowExecutionResult> {
    if existing.definition_id != definition.id {
        return Err(CoreError::DuplicateEntity {
            collection: WorkflowInstance::COLLECTION,
            id: existing.id,
        });
    }
    if existing.status() == WorkflowStatus::Running {
        return Err(CoreError::InstanceBusy {
            instance_id: existing.id,
        });
    }
    debug!(instance_id = %existing.id, "Instance already exists");
    Ok(WorkflowExecutionResult::from(&existing))
}

fn into_result(result: ValidationResult) -> Result<()> {
    for warning in &result.warnings {
        warn!(%warning, "Definition validation warning");
    }
    if result.has_errors() {
        warn!(errors = result.errors.len(), "Definition rejected");
        return Err(CoreError::Validation {
            errors: result.errors,
        });
    }
    Ok(())
}
