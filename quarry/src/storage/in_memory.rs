//! In-memory storage implementation.
//!
//! Requests and steps live in concurrent maps guarded by a single RwLock
//! each. Suitable for tests and single-process deployments; everything is
//! lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::Storage;
use crate::errors::{Error, Result};
use crate::request::{AnalysisRequest, AnalysisStatus, ExecutionStep};
use crate::types::{RequestId, StepId, WorkerId};

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    requests: Arc<RwLock<HashMap<RequestId, AnalysisRequest>>>,
    steps: Arc<RwLock<HashMap<StepId, ExecutionStep>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_request(&self, request: AnalysisRequest) -> Result<()> {
        let mut requests = self.requests.write();
        if requests.contains_key(&request.id) {
            return Err(Error::Validation(format!(
                "request {} already exists",
                request.id
            )));
        }
        requests.insert(request.id, request);
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<AnalysisRequest> {
        self.requests
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::RequestNotFound(id))
    }

    async fn update_request(&self, request: &AnalysisRequest) -> Result<()> {
        let mut requests = self.requests.write();
        let existing = requests
            .get_mut(&request.id)
            .ok_or(Error::RequestNotFound(request.id))?;

        // A status change must be legal. This is what makes a racing cancel
        // stick: the pipeline's stale copy fails here instead of clobbering.
        if existing.status != request.status
            && !existing.status.can_transition_to(request.status)
        {
            return Err(Error::StateTransition {
                id: request.id,
                from: existing.status,
                to: request.status,
            });
        }

        let mut updated = request.clone();
        updated.updated_at = Utc::now();
        *existing = updated;
        Ok(())
    }

    async fn transition(&self, id: RequestId, to: AnalysisStatus) -> Result<AnalysisRequest> {
        let mut requests = self.requests.write();
        let existing = requests.get_mut(&id).ok_or(Error::RequestNotFound(id))?;

        if !existing.status.can_transition_to(to) {
            return Err(Error::StateTransition {
                id,
                from: existing.status,
                to,
            });
        }

        existing.status = to;
        existing.updated_at = Utc::now();
        if to == AnalysisStatus::Completed {
            existing.completed_at = Some(existing.updated_at);
        }
        Ok(existing.clone())
    }

    async fn claim_pending(
        &self,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<AnalysisRequest>> {
        let mut requests = self.requests.write();
        let now = Utc::now();

        // Oldest first.
        let mut pending: Vec<(chrono::DateTime<Utc>, RequestId)> = requests
            .values()
            .filter(|r| r.status == AnalysisStatus::Pending)
            .map(|r| (r.created_at, r.id))
            .collect();
        pending.sort_by_key(|(created_at, _)| *created_at);
        pending.truncate(limit);

        let mut claimed = Vec::with_capacity(pending.len());
        for (_, id) in pending {
            if let Some(request) = requests.get_mut(&id) {
                request.status = AnalysisStatus::Analyzing;
                request.claimed_by = Some(worker_id);
                request.updated_at = now;
                claimed.push(request.clone());
            }
        }
        Ok(claimed)
    }

    async fn count_by_status(&self, status: AnalysisStatus) -> Result<usize> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| r.status == status)
            .count())
    }

    async fn insert_step(&self, step: ExecutionStep) -> Result<()> {
        self.steps.write().insert(step.id, step);
        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> Result<()> {
        let mut steps = self.steps.write();
        match steps.get_mut(&step.id) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(Error::Validation(format!("step {} not found", step.id))),
        }
    }

    async fn steps_for_request(&self, id: RequestId) -> Result<Vec<ExecutionStep>> {
        let steps = self.steps.read();
        let mut result: Vec<ExecutionStep> = steps
            .values()
            .filter(|s| s.request_id == id)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.sequence);
        Ok(result)
    }

    async fn delete_steps(&self, id: RequestId) -> Result<()> {
        self.steps.write().retain(|_, s| s.request_id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Requester;
    use crate::types::{Language, StepType, SubscriptionTier, TechnicalLevel};
    use uuid::Uuid;

    fn sample_request() -> AnalysisRequest {
        AnalysisRequest::new(
            "What drives churn in the premium segment?".to_string(),
            Uuid::new_v4(),
            Requester {
                user_id: Uuid::new_v4(),
                org_id: Uuid::new_v4(),
                subscription_tier: SubscriptionTier::Professional,
                technical_level: TechnicalLevel::Intermediate,
            },
        )
    }

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let storage = InMemoryStorage::new();
        let request = sample_request();
        let id = request.id;

        storage.insert_request(request.clone()).await.unwrap();
        let fetched = storage.get_request(id).await.unwrap();
        assert_eq!(fetched, request);

        // Duplicate insert rejected.
        assert!(storage.insert_request(request).await.is_err());
    }

    #[tokio::test]
    async fn transition_validates_against_table() {
        let storage = InMemoryStorage::new();
        let request = sample_request();
        let id = request.id;
        storage.insert_request(request).await.unwrap();

        let updated = storage
            .transition(id, AnalysisStatus::Analyzing)
            .await
            .unwrap();
        assert_eq!(updated.status, AnalysisStatus::Analyzing);

        // Analyzing -> Analyzing is not in the table.
        let err = storage
            .transition(id, AnalysisStatus::Analyzing)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateTransition { .. }));
    }

    #[tokio::test]
    async fn claim_is_atomic_across_workers() {
        let storage = InMemoryStorage::new();
        let worker1 = Uuid::new_v4();
        let worker2 = Uuid::new_v4();

        storage.insert_request(sample_request()).await.unwrap();
        storage.insert_request(sample_request()).await.unwrap();

        let claimed = storage.claim_pending(10, worker1).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|r| r.claimed_by == Some(worker1)));
        assert!(claimed
            .iter()
            .all(|r| r.status == AnalysisStatus::Analyzing));

        let claimed2 = storage.claim_pending(10, worker2).await.unwrap();
        assert!(claimed2.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_age_order() {
        let storage = InMemoryStorage::new();
        let worker = Uuid::new_v4();

        let mut first = sample_request();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let first_id = first.id;
        storage.insert_request(first).await.unwrap();
        storage.insert_request(sample_request()).await.unwrap();

        let claimed = storage.claim_pending(1, worker).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first_id);
    }

    #[tokio::test]
    async fn stale_writer_cannot_clobber_a_cancel() {
        let storage = InMemoryStorage::new();
        let request = sample_request();
        let id = request.id;
        storage.insert_request(request).await.unwrap();

        storage
            .transition(id, AnalysisStatus::Analyzing)
            .await
            .unwrap();
        let stale = storage.get_request(id).await.unwrap();

        // Cancel lands: analyzing -> failed.
        storage.transition(id, AnalysisStatus::Failed).await.unwrap();

        // The pipeline tries to push its stale analyzing copy forward.
        let mut from_pipeline = stale;
        from_pipeline.status = AnalysisStatus::GeneratingCode;
        let err = storage.update_request(&from_pipeline).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition { .. }));
        assert_eq!(
            storage.get_request(id).await.unwrap().status,
            AnalysisStatus::Failed
        );
    }

    #[tokio::test]
    async fn steps_ordered_by_sequence_and_deletable() {
        let storage = InMemoryStorage::new();
        let request = sample_request();
        let id = request.id;
        storage.insert_request(request).await.unwrap();

        for seq in [2u32, 0, 1] {
            storage
                .insert_step(ExecutionStep::new(
                    id,
                    seq,
                    StepType::DataExploration,
                    Language::Python,
                    format!("step {seq}"),
                ))
                .await
                .unwrap();
        }

        let steps = storage.steps_for_request(id).await.unwrap();
        assert_eq!(
            steps.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        storage.delete_steps(id).await.unwrap();
        assert!(storage.steps_for_request(id).await.unwrap().is_empty());
    }
}
