//! In-process action transport
//!
//! Connects an [`ActionClient`] to an [`ActionServerEndpoint`] over tokio
//! channels. The protocol mirrors a classic action service: a goal request is
//! answered with accept/reject, feedback is streamed on a per-goal channel,
//! and the terminal result is fetched with a separate request.
//!
//! ```text
//! ActionClient ──[SendGoal]──► Endpoint ──► accept/reject (oneshot)
//!              ──[GetResult]─►          ──► result (oneshot)
//!              ◄──────────── feedback (mpsc, per goal)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::messages::{
    FollowJointTrajectoryFeedback, FollowJointTrajectoryGoal, FollowJointTrajectoryResult, GoalId,
};

/// Buffered feedback messages per goal before the server starts dropping them
const FEEDBACK_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action server {0} is gone")]
    ServerGone(String),

    #[error("Goal response for {0} was dropped by the server")]
    ResponseDropped(GoalId),

    #[error("Result for {0} was dropped by the server")]
    ResultDropped(GoalId),

    #[error("{0} was rejected, no result available")]
    GoalRejected(GoalId),
}

/// Requests arriving at the server side of the channel
#[derive(Debug)]
pub enum ActionRequest {
    SendGoal {
        goal_id: GoalId,
        goal: FollowJointTrajectoryGoal,
        response: oneshot::Sender<bool>,
        feedback: mpsc::Sender<FollowJointTrajectoryFeedback>,
    },
    GetResult {
        goal_id: GoalId,
        result: oneshot::Sender<FollowJointTrajectoryResult>,
    },
}

/// Creates a connected client/server pair for the named action
///
/// The server starts out not ready; call [`ActionServerEndpoint::set_ready`]
/// once it is able to take goals.
pub fn channel(action_name: &str, capacity: usize) -> (ActionClient, ActionServerEndpoint) {
    let (request_sender, request_receiver) = mpsc::channel(capacity);
    let (ready_sender, ready_receiver) = watch::channel(false);
    let action_name: Arc<str> = Arc::from(action_name);
    debug!(
        "Created action channel {} with request capacity {}",
        action_name, capacity
    );

    let client = ActionClient {
        action_name: action_name.clone(),
        request_sender,
        ready: ready_receiver,
        next_goal_id: Arc::new(AtomicU64::new(0)),
    };
    let endpoint = ActionServerEndpoint {
        action_name,
        request_receiver,
        ready: ready_sender,
    };
    (client, endpoint)
}

#[derive(Clone, Debug)]
pub struct ActionClient {
    action_name: Arc<str>,
    request_sender: mpsc::Sender<ActionRequest>,
    ready: watch::Receiver<bool>,
    next_goal_id: Arc<AtomicU64>,
}

impl ActionClient {
    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn server_is_ready(&self) -> bool {
        *self.ready.borrow() && !self.request_sender.is_closed()
    }

    /// Waits up to `timeout` for the server to report ready
    pub async fn wait_for_server(&self, timeout: Duration) -> bool {
        if self.request_sender.is_closed() {
            return false;
        }
        let mut ready = self.ready.clone();
        let waited = tokio::time::timeout(timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.is_ok());
        match waited {
            Ok(true) => true,
            Ok(false) => {
                debug!("Readiness signal of {} closed", self.action_name);
                false
            }
            Err(_) => false,
        }
    }

    /// Allocates the id for a goal that is about to be sent
    pub fn new_goal_id(&self) -> GoalId {
        GoalId(self.next_goal_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Sends a goal without waiting for the server's answer
    pub async fn send_goal(
        &self,
        goal: FollowJointTrajectoryGoal,
    ) -> Result<PendingGoal, ActionError> {
        self.send_goal_with_id(self.new_goal_id(), goal).await
    }

    pub async fn send_goal_with_id(
        &self,
        goal_id: GoalId,
        goal: FollowJointTrajectoryGoal,
    ) -> Result<PendingGoal, ActionError> {
        let (response_sender, response_receiver) = oneshot::channel();
        let (feedback_sender, feedback_receiver) = mpsc::channel(FEEDBACK_CAPACITY);

        debug!("Sending {} to {}", goal_id, self.action_name);
        self.request_sender
            .send(ActionRequest::SendGoal {
                goal_id,
                goal,
                response: response_sender,
                feedback: feedback_sender,
            })
            .await
            .map_err(|_| ActionError::ServerGone(self.action_name.to_string()))?;

        Ok(PendingGoal {
            goal_id,
            response: response_receiver,
            feedback: feedback_receiver,
            client: self.clone(),
        })
    }
}

/// A goal that was sent but not yet answered
#[derive(Debug)]
pub struct PendingGoal {
    goal_id: GoalId,
    response: oneshot::Receiver<bool>,
    feedback: mpsc::Receiver<FollowJointTrajectoryFeedback>,
    client: ActionClient,
}

impl PendingGoal {
    pub fn goal_id(&self) -> GoalId {
        self.goal_id
    }

    /// Resolves once the server accepted or rejected the goal
    pub async fn response(self) -> Result<GoalHandle, ActionError> {
        let PendingGoal {
            goal_id,
            response,
            feedback,
            client,
        } = self;
        let accepted = response
            .await
            .map_err(|_| ActionError::ResponseDropped(goal_id))?;
        Ok(GoalHandle {
            goal_id,
            accepted,
            feedback,
            client,
        })
    }
}

/// An answered goal
#[derive(Debug)]
pub struct GoalHandle {
    goal_id: GoalId,
    accepted: bool,
    feedback: mpsc::Receiver<FollowJointTrajectoryFeedback>,
    client: ActionClient,
}

impl GoalHandle {
    pub fn goal_id(&self) -> GoalId {
        self.goal_id
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }

    /// Asks the server for the terminal result
    ///
    /// The returned receiver completes when the goal reaches a terminal state.
    pub async fn request_result(
        &self,
    ) -> Result<oneshot::Receiver<FollowJointTrajectoryResult>, ActionError> {
        if !self.accepted {
            warn!("Result requested for rejected {}", self.goal_id);
            return Err(ActionError::GoalRejected(self.goal_id));
        }
        let (result_sender, result_receiver) = oneshot::channel();
        self.client
            .request_sender
            .send(ActionRequest::GetResult {
                goal_id: self.goal_id,
                result: result_sender,
            })
            .await
            .map_err(|_| ActionError::ServerGone(self.client.action_name.to_string()))?;
        Ok(result_receiver)
    }

    /// Next feedback message, `None` once the server closed the stream
    pub async fn next_feedback(&mut self) -> Option<FollowJointTrajectoryFeedback> {
        self.feedback.recv().await
    }
}

/// Server side of an action channel
#[derive(Debug)]
pub struct ActionServerEndpoint {
    action_name: Arc<str>,
    request_receiver: mpsc::Receiver<ActionRequest>,
    ready: watch::Sender<bool>,
}

impl ActionServerEndpoint {
    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn set_ready(&self, ready: bool) {
        debug!("Action server {} ready: {}", self.action_name, ready);
        self.ready.send_replace(ready);
    }

    pub async fn recv(&mut self) -> Option<ActionRequest> {
        self.request_receiver.recv().await
    }
}
