//! # Budget Guard
//!
//! Spend enforcement around agent invocations.
//!
//! Before a dispatch the guard reserves the role's estimated cost against both
//! the execution and the project ledger; a reservation that would cross either
//! ceiling is rejected and the task is never invoked. After the invocation the
//! actual cost is debited under the invocation's [`ChargeKey`] (see
//! [`crate::state_machine::TaskStateMachine::transition_with_charge`]), and
//! the guard records the outcome. Every check-and-debit runs inside the store
//! under a lock, so concurrent tasks of one project cannot overshoot.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::constants::events as event_names;
use crate::database::{CeilingUpdate, ExecutionStore};
use crate::events::EventPublisher;
use crate::logging::log_budget_operation;
use crate::models::{
    BudgetDecision, BudgetSnapshot, ChargeKey, ChargeOutcome, Cost, FailureReason, TaskRecord,
};

#[derive(Clone)]
pub struct BudgetGuard {
    store: Arc<dyn ExecutionStore>,
    event_publisher: Arc<EventPublisher>,
}

impl std::fmt::Debug for BudgetGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGuard").finish_non_exhaustive()
    }
}

impl BudgetGuard {
    pub fn new(store: Arc<dyn ExecutionStore>, event_publisher: Arc<EventPublisher>) -> Self {
        Self {
            store,
            event_publisher,
        }
    }

    /// Reserve `estimate` for one invocation, or report which ceiling refused it
    pub async fn reserve_or_reject(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        estimate: Cost,
    ) -> OrchestrationResult<BudgetDecision> {
        let decision = self
            .store
            .reserve_budget(execution_uuid, key, estimate)
            .await
            .map_err(OrchestrationError::from_lookup)?;

        match &decision {
            BudgetDecision::Admitted => {
                log_budget_operation(
                    "reserve",
                    execution_uuid,
                    None,
                    estimate.micros(),
                    "admitted",
                );
            }
            BudgetDecision::Rejected {
                scope,
                requested,
                spent,
                reserved,
                ceiling,
            } => {
                log_budget_operation(
                    "reserve",
                    execution_uuid,
                    Some(&scope.to_string()),
                    requested.micros(),
                    "rejected",
                );
                self.publish_rejection(
                    execution_uuid,
                    json!({
                        "execution_uuid": execution_uuid,
                        "stage": "reserve",
                        "scope": scope,
                        "requested": requested,
                        "spent": spent,
                        "reserved": reserved,
                        "ceiling": ceiling,
                    }),
                )
                .await;
            }
        }
        Ok(decision)
    }

    /// Drop the hold for an invocation that ended without a charge
    pub async fn release(&self, execution_uuid: Uuid, key: ChargeKey) -> OrchestrationResult<()> {
        self.store
            .release_reservation(execution_uuid, key)
            .await
            .map_err(OrchestrationError::from_lookup)
    }

    /// Debit a charge outside of a task transition
    pub async fn commit(
        &self,
        execution_uuid: Uuid,
        key: ChargeKey,
        actual: Cost,
    ) -> OrchestrationResult<ChargeOutcome> {
        let outcome = self
            .store
            .commit_charge(execution_uuid, key, actual)
            .await
            .map_err(OrchestrationError::from_lookup)?;
        self.record_charge(execution_uuid, None, key, actual, &outcome)
            .await;
        Ok(outcome)
    }

    /// Log and publish the outcome of a completed task's charge
    pub async fn record_charge(
        &self,
        execution_uuid: Uuid,
        task: Option<&TaskRecord>,
        key: ChargeKey,
        actual: Cost,
        outcome: &ChargeOutcome,
    ) {
        let task_uuid = task.map(|task| task.task_uuid);
        match outcome {
            ChargeOutcome::Committed {
                execution_spent,
                project_spent,
            } => {
                log_budget_operation("commit", execution_uuid, None, actual.micros(), "committed");
                let _ = self
                    .event_publisher
                    .publish(
                        event_names::BUDGET_COMMITTED,
                        json!({
                            "execution_uuid": execution_uuid,
                            "task_uuid": task_uuid,
                            "charge_key": key,
                            "amount": actual,
                            "execution_spent": execution_spent,
                            "project_spent": project_spent,
                        }),
                    )
                    .await;
            }
            ChargeOutcome::AlreadyCommitted => {
                info!(
                    execution_uuid = %execution_uuid,
                    charge_key = %key,
                    "Charge already committed; ignoring replay"
                );
            }
            ChargeOutcome::Rejected {
                scope,
                attempted,
                spent,
                ceiling,
            } => {
                warn!(
                    execution_uuid = %execution_uuid,
                    scope = %scope,
                    attempted = %attempted,
                    spent = %spent,
                    ceiling = %ceiling,
                    "Charge rejected by spend ceiling"
                );
                log_budget_operation(
                    "commit",
                    execution_uuid,
                    Some(&scope.to_string()),
                    attempted.micros(),
                    "rejected",
                );
                self.publish_rejection(
                    execution_uuid,
                    json!({
                        "execution_uuid": execution_uuid,
                        "task_uuid": task_uuid,
                        "stage": "commit",
                        "scope": scope,
                        "requested": attempted,
                        "spent": spent,
                        "ceiling": ceiling,
                    }),
                )
                .await;
            }
        }
    }

    pub async fn snapshot(&self, execution_uuid: Uuid) -> OrchestrationResult<BudgetSnapshot> {
        self.store
            .budget_snapshot(execution_uuid)
            .await
            .map_err(OrchestrationError::from_lookup)
    }

    pub async fn update_ceilings(
        &self,
        execution_uuid: Uuid,
        update: CeilingUpdate,
    ) -> OrchestrationResult<BudgetSnapshot> {
        let snapshot = self
            .store
            .update_ceilings(execution_uuid, update)
            .await
            .map_err(OrchestrationError::from_lookup)?;
        info!(
            execution_uuid = %execution_uuid,
            execution_ceiling = %snapshot.execution.ceiling,
            project_ceiling = %snapshot.project.ceiling,
            "Spend ceilings updated"
        );
        Ok(snapshot)
    }

    async fn publish_rejection(&self, execution_uuid: Uuid, context: serde_json::Value) {
        if let Err(error) = self
            .event_publisher
            .publish(event_names::BUDGET_REJECTED, context)
            .await
        {
            warn!(
                execution_uuid = %execution_uuid,
                error = %error,
                "Failed to publish budget rejection"
            );
        }
    }

    /// Failure reason for a reservation the guard refused
    pub fn reservation_failure(
        decision: &BudgetDecision,
        task: &TaskRecord,
    ) -> Option<FailureReason> {
        match decision {
            BudgetDecision::Admitted => None,
            BudgetDecision::Rejected {
                scope,
                requested,
                spent,
                ceiling,
                ..
            } => Some(FailureReason::BudgetExceeded {
                scope: *scope,
                task_uuid: Some(task.task_uuid),
                attempted: *requested,
                spent: *spent,
                ceiling: *ceiling,
            }),
        }
    }

    /// Failure reason for a debit the store refused
    pub fn charge_failure(outcome: &ChargeOutcome, task: &TaskRecord) -> Option<FailureReason> {
        match outcome {
            ChargeOutcome::Rejected {
                scope,
                attempted,
                spent,
                ceiling,
            } => Some(FailureReason::BudgetExceeded {
                scope: *scope,
                task_uuid: Some(task.task_uuid),
                attempted: *attempted,
                spent: *spent,
                ceiling: *ceiling,
            }),
            _ => None,
        }
    }
}
