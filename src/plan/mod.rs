//! Execution plans — dependency graphs of tool invocations.
//!
//! A plan either fans out all steps concurrently (parallelizable) or walks
//! a Kahn topological order of the dependency graph sequentially. Partial
//! failures aggregate into one coordinated result; the coordinator throws
//! only for structurally invalid input (duplicate steps, unknown
//! dependencies, cycles).

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::{CoordinatorEvent, MetricsSink};
use crate::executor::{InvocationExecutor, ToolInvocation, ToolResult};
use crate::types::{
    Error, InvocationId, PlanId, Result, RetryConfig, StepId, TenantId, ToolId, UserId,
};

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub tool_id: ToolId,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// A failed critical step aborts the remaining sequential plan. A step
    /// is also treated as critical when `priority == 1`, preserving the
    /// numeric convention existing callers rely on.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_priority() -> u32 {
    5
}

impl PlanStep {
    pub fn new(id: StepId, tool_id: ToolId, parameters: Value) -> Self {
        Self {
            id,
            tool_id,
            parameters,
            priority: default_priority(),
            critical: false,
            dependencies: Vec::new(),
            timeout: None,
            retry: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, step: StepId) -> Self {
        self.dependencies.push(step);
        self
    }

    fn is_critical(&self) -> bool {
        self.critical || self.priority == 1
    }
}

/// A set of steps plus execution mode and an optional degraded-mode plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub steps: Vec<PlanStep>,
    pub parallelizable: bool,
    /// Executed once (one level deep) when the primary plan fails.
    #[serde(default)]
    pub fallback_plan: Option<Box<ExecutionPlan>>,
}

impl ExecutionPlan {
    pub fn sequential(steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: PlanId::new(),
            steps,
            parallelizable: false,
            fallback_plan: None,
        }
    }

    pub fn parallel(steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: PlanId::new(),
            steps,
            parallelizable: true,
            fallback_plan: None,
        }
    }

    pub fn with_fallback(mut self, fallback: ExecutionPlan) -> Self {
        self.fallback_plan = Some(Box::new(fallback));
        self
    }

    /// Structural validation: unique step ids, and for sequential plans
    /// every dependency must name a step in the plan.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(Error::validation(format!("duplicate step id: {}", step.id)));
            }
        }
        if !self.parallelizable {
            for step in &self.steps {
                for dep in &step.dependencies {
                    if !seen.contains(dep) {
                        return Err(Error::validation(format!(
                            "step {} depends on unknown step {}",
                            step.id, dep
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Result of one step within a coordinated plan.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step_id: StepId,
    pub result: ToolResult,
}

/// Aggregated outcome of a coordinated plan.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatedPlanResult {
    pub plan_id: PlanId,
    /// One entry per requested step, including skipped and failed ones.
    pub results: Vec<StepOutcome>,
    pub success: bool,
    /// Wall-clock from plan start to last step completion.
    pub total_latency_ms: u64,
    pub failed_steps: Vec<StepId>,
    /// True when this result came from the plan's fallback plan.
    pub from_fallback_plan: bool,
}

/// Runs execution plans against the invocation executor.
#[derive(Debug)]
pub struct PlanCoordinator {
    executor: Arc<InvocationExecutor>,
    sink: Arc<dyn MetricsSink>,
}

impl PlanCoordinator {
    pub fn new(executor: Arc<InvocationExecutor>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { executor, sink }
    }

    /// Execute a plan for one tenant. Returns Err only for structurally
    /// invalid plans; per-step failures land in the aggregated result.
    ///
    /// There is no plan-level timeout; callers needing one wrap this call
    /// externally.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        tenant_id: &TenantId,
        user_id: Option<&UserId>,
    ) -> Result<CoordinatedPlanResult> {
        // Validate the whole chain up front so a bad fallback plan fails
        // before any primary step runs.
        plan.validate()?;
        let order = if plan.parallelizable {
            None
        } else {
            Some(topological_order(&plan.steps)?)
        };
        if let Some(fallback) = &plan.fallback_plan {
            fallback.validate()?;
            if !fallback.parallelizable {
                topological_order(&fallback.steps)?;
            }
        }

        let primary = self.run_plan(plan, order, tenant_id, user_id).await;
        if primary.success {
            return Ok(primary);
        }

        match &plan.fallback_plan {
            Some(fallback) => {
                tracing::warn!(
                    plan = %plan.plan_id,
                    failed_steps = primary.failed_steps.len(),
                    "plan failed, executing fallback plan"
                );
                let fallback_order = if fallback.parallelizable {
                    None
                } else {
                    Some(topological_order(&fallback.steps)?)
                };
                let mut result = self
                    .run_plan(fallback, fallback_order, tenant_id, user_id)
                    .await;
                result.from_fallback_plan = true;
                Ok(result)
            }
            None => Ok(primary),
        }
    }

    async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        order: Option<Vec<usize>>,
        tenant_id: &TenantId,
        user_id: Option<&UserId>,
    ) -> CoordinatedPlanResult {
        let started = Instant::now();
        tracing::info!(
            plan = %plan.plan_id,
            tenant = %tenant_id,
            user = user_id.map(UserId::as_str).unwrap_or("-"),
            steps = plan.steps.len(),
            parallel = plan.parallelizable,
            "executing plan"
        );

        let (results, failed_steps) = match order {
            None => self.run_parallel(plan, tenant_id).await,
            Some(order) => self.run_sequential(plan, &order, tenant_id).await,
        };

        let total_latency_ms = started.elapsed().as_millis() as u64;
        let success = failed_steps.is_empty();

        self.sink.record(CoordinatorEvent::plan_execution(
            plan.plan_id.as_str(),
            tenant_id.as_str(),
            success,
            total_latency_ms,
        ));

        CoordinatedPlanResult {
            plan_id: plan.plan_id.clone(),
            results,
            success,
            total_latency_ms,
            failed_steps,
            from_fallback_plan: false,
        }
    }

    /// Fan out every step concurrently and wait for all to settle. Never
    /// short-circuits on first failure: every step reports a result.
    async fn run_parallel(
        &self,
        plan: &ExecutionPlan,
        tenant_id: &TenantId,
    ) -> (Vec<StepOutcome>, Vec<StepId>) {
        let futures = plan.steps.iter().map(|step| async move {
            let invocation = step_invocation(step, tenant_id);
            let result = self.executor.invoke(&invocation).await;
            StepOutcome {
                step_id: step.id.clone(),
                result,
            }
        });

        let results = join_all(futures).await;
        let failed_steps = results
            .iter()
            .filter(|o| !o.result.success)
            .map(|o| o.step_id.clone())
            .collect();
        (results, failed_steps)
    }

    /// Walk the topological order sequentially, skipping steps with unmet
    /// dependencies and aborting the remainder after a critical failure.
    async fn run_sequential(
        &self,
        plan: &ExecutionPlan,
        order: &[usize],
        tenant_id: &TenantId,
    ) -> (Vec<StepOutcome>, Vec<StepId>) {
        let mut completed: HashSet<StepId> = HashSet::new();
        let mut failed_steps: Vec<StepId> = Vec::new();
        let mut results: Vec<StepOutcome> = Vec::with_capacity(plan.steps.len());
        let mut abort_reason: Option<String> = None;

        for &idx in order {
            let step = &plan.steps[idx];

            if let Some(reason) = &abort_reason {
                failed_steps.push(step.id.clone());
                results.push(skipped_outcome(step, reason.clone()));
                continue;
            }

            if !step.dependencies.iter().all(|dep| completed.contains(dep)) {
                tracing::debug!(plan = %plan.plan_id, step = %step.id, "dependencies not met");
                failed_steps.push(step.id.clone());
                results.push(skipped_outcome(step, Error::DependenciesNotMet.to_string()));
                continue;
            }

            let invocation = step_invocation(step, tenant_id);
            let result = self.executor.invoke(&invocation).await;

            if result.success {
                completed.insert(step.id.clone());
            } else {
                failed_steps.push(step.id.clone());
                if step.is_critical() {
                    tracing::warn!(
                        plan = %plan.plan_id,
                        step = %step.id,
                        "critical step failed, aborting remaining steps"
                    );
                    abort_reason = Some(format!("Aborted: critical step {} failed", step.id));
                }
            }

            results.push(StepOutcome {
                step_id: step.id.clone(),
                result,
            });
        }

        (results, failed_steps)
    }
}

fn step_invocation(step: &PlanStep, tenant_id: &TenantId) -> ToolInvocation {
    let mut invocation = ToolInvocation::new(
        step.tool_id.clone(),
        tenant_id.clone(),
        step.parameters.clone(),
    )
    .with_priority(step.priority);
    invocation.timeout = step.timeout;
    invocation.retry = step.retry.clone();
    invocation
}

/// Synthesize a failed result for a step whose tool was never invoked.
fn skipped_outcome(step: &PlanStep, reason: String) -> StepOutcome {
    StepOutcome {
        step_id: step.id.clone(),
        result: ToolResult {
            invocation_id: InvocationId::new(),
            tool_id: step.tool_id.clone(),
            success: false,
            result: None,
            error: Some(reason),
            fallback: false,
            latency_ms: 0,
            retry_count: 0,
            timestamp: Utc::now(),
        },
    }
}

/// Kahn topological order over the step dependency graph.
///
/// Returns indices into `steps` such that every step appears after all of
/// its dependencies. A cycle is a caller error, surfaced before any step
/// executes.
pub fn topological_order(steps: &[PlanStep]) -> Result<Vec<usize>> {
    let index_by_id: HashMap<&StepId, usize> =
        steps.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            let &dep_idx = index_by_id
                .get(dep)
                .ok_or_else(|| Error::validation(format!("unknown dependency: {}", dep)))?;
            indegree[i] += 1;
            dependents[dep_idx].push(i);
        }
    }

    // Seed with plan order for deterministic output among independent steps.
    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<String> = (0..steps.len())
            .filter(|i| !order.contains(i))
            .map(|i| steps[i].id.to_string())
            .collect();
        return Err(Error::cyclic_plan(format!(
            "dependency cycle among steps: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        let mut step = PlanStep::new(
            StepId::must(id),
            ToolId::must("retrieval"),
            Value::Null,
        );
        step.dependencies = deps.iter().map(|d| StepId::must(*d)).collect();
        step
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let steps = vec![step("c", &["a", "b"]), step("a", &[]), step("b", &["a"])];
        let order = topological_order(&steps).unwrap();

        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
        // a (idx 1) before b (idx 2) before c (idx 0)
        assert!(position[&1] < position[&2]);
        assert!(position[&2] < position[&0]);
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let result = topological_order(&steps);
        assert!(matches!(result, Err(Error::CyclicPlan(_))));
    }

    #[test]
    fn test_self_cycle_detected() {
        let steps = vec![step("a", &["a"])];
        assert!(matches!(
            topological_order(&steps),
            Err(Error::CyclicPlan(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_is_validation_error() {
        let steps = vec![step("a", &["ghost"])];
        assert!(matches!(
            topological_order(&steps),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_plan_validate_duplicate_ids() {
        let plan = ExecutionPlan::sequential(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(plan.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_priority_one_is_critical() {
        let critical_by_flag = step("a", &[]).critical();
        let critical_by_priority = step("b", &[]).with_priority(1);
        let ordinary = step("c", &[]);

        assert!(critical_by_flag.is_critical());
        assert!(critical_by_priority.is_critical());
        assert!(!ordinary.is_critical());
    }

    #[test]
    fn test_empty_plan_orders_empty() {
        assert!(topological_order(&[]).unwrap().is_empty());
    }

    proptest! {
        /// Any DAG built from backward-pointing edges orders dependencies
        /// before their dependents.
        #[test]
        fn prop_topological_order_is_valid(dep_picks in prop::collection::vec(
            prop::collection::vec(0usize..100, 0..3), 1..8,
        )) {
            let steps: Vec<PlanStep> = dep_picks
                .iter()
                .enumerate()
                .map(|(i, picks)| {
                    let mut deps: Vec<&str> = Vec::new();
                    let names = ["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7"];
                    let mut step = PlanStep::new(
                        StepId::must(names[i]),
                        ToolId::must("retrieval"),
                        Value::Null,
                    );
                    if i > 0 {
                        for pick in picks {
                            let dep = pick % i;
                            if !deps.contains(&names[dep]) {
                                deps.push(names[dep]);
                                step.dependencies.push(StepId::must(names[dep]));
                            }
                        }
                    }
                    step
                })
                .collect();

            let order = topological_order(&steps).unwrap();
            prop_assert_eq!(order.len(), steps.len());

            let position: HashMap<usize, usize> =
                order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
            for (i, step) in steps.iter().enumerate() {
                for dep in &step.dependencies {
                    let dep_idx = steps.iter().position(|s| &s.id == dep).unwrap();
                    prop_assert!(position[&dep_idx] < position[&i]);
                }
            }
        }
    }
}
