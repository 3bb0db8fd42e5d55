//! Persistence contract for requests and steps.
//!
//! Durable stores are external collaborators; this trait is the seam. The
//! in-memory implementation is used by tests and single-process deployments.

use async_trait::async_trait;

use crate::errors::Result;
use crate::request::{AnalysisRequest, AnalysisStatus, ExecutionStep};
use crate::types::{RequestId, WorkerId};

pub mod in_memory;

pub use in_memory::InMemoryStorage;

/// Storage for analysis requests and their execution steps.
///
/// Every status change goes through this layer and is validated against
/// `AnalysisStatus::allowed_transitions`, so a racing writer (for example a
/// cancel landing mid-pipeline) cannot be silently overwritten.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Insert a newly submitted request.
    ///
    /// # Errors
    /// - `Validation` if a request with the same ID already exists
    async fn insert_request(&self, request: AnalysisRequest) -> Result<()>;

    /// Fetch a request by ID.
    async fn get_request(&self, id: RequestId) -> Result<AnalysisRequest>;

    /// Persist an updated request.
    ///
    /// If the stored status differs from the incoming one, the change must
    /// be legal per the transition table; otherwise `StateTransition` is
    /// returned and the stored record is left untouched.
    async fn update_request(&self, request: &AnalysisRequest) -> Result<()>;

    /// Atomically move a request to a new status and return the updated
    /// record. Rejects illegal transitions.
    async fn transition(&self, id: RequestId, to: AnalysisStatus) -> Result<AnalysisRequest>;

    /// Atomically claim up to `limit` pending requests for a worker,
    /// transitioning them to `analyzing`. Concurrent workers never receive
    /// the same request.
    async fn claim_pending(
        &self,
        limit: usize,
        worker_id: WorkerId,
    ) -> Result<Vec<AnalysisRequest>>;

    /// Number of requests currently in the given status.
    async fn count_by_status(&self, status: AnalysisStatus) -> Result<usize>;

    async fn insert_step(&self, step: ExecutionStep) -> Result<()>;

    async fn update_step(&self, step: &ExecutionStep) -> Result<()>;

    /// Steps for a request, ordered by sequence number.
    async fn steps_for_request(&self, id: RequestId) -> Result<Vec<ExecutionStep>>;

    /// Remove all steps for a request. Used by retry so a fresh run plans
    /// from scratch.
    async fn delete_steps(&self, id: RequestId) -> Result<()>;
}
