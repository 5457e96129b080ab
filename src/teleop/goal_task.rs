//! Per-goal lifecycle as a statum state machine
//!
//! Every submitted goal is driven by its own [`GoalTask`]. The task reports
//! each step back to the controller as a [`GoalEvent`] tagged with the goal's
//! id, so overlapping goals never share lifecycle state.
//!
//! ```text
//! Idle ──submit──► Submitted ──await_response──► Rejected
//!                                   │
//!                                   └──► Accepted ──follow──► Resolved(outcome)
//!                                          (feedback events)
//! ```

use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::error::TeleopError;
use crate::action::{
    ActionClient, ActionError, FollowJointTrajectoryFeedback, FollowJointTrajectoryGoal,
    FollowJointTrajectoryResult, GoalHandle, GoalId, GoalOutcome, PendingGoal,
};

/// Progress of one goal as seen by the controller
#[derive(Debug, Clone)]
pub struct GoalEvent {
    pub goal_id: GoalId,
    pub kind: GoalEventKind,
}

#[derive(Debug, Clone)]
pub enum GoalEventKind {
    Response { accepted: bool },
    Feedback(FollowJointTrajectoryFeedback),
    Result(FollowJointTrajectoryResult),
    /// The goal was lost before the server answered it
    Failed(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum GoalState {
    Idle,
    Submitted,
    Accepted,
    Rejected,
    Resolved(GoalOutcome),
}

#[machine]
pub struct GoalTask<S: GoalState> {
    goal_id: GoalId,
    goal: FollowJointTrajectoryGoal,
    client: ActionClient,
    events: mpsc::Sender<GoalEvent>,
    pending: Option<PendingGoal>,
    handle: Option<GoalHandle>,
}

/// Outcome of [`GoalTask::await_response`]
pub enum GoalResponse {
    Accepted(GoalTask<Accepted>),
    Rejected(GoalTask<Rejected>),
}

impl<S: GoalState> GoalTask<S> {
    pub fn goal_id(&self) -> GoalId {
        self.goal_id
    }
}

impl GoalTask<Idle> {
    pub fn create(
        client: ActionClient,
        goal: FollowJointTrajectoryGoal,
        events: mpsc::Sender<GoalEvent>,
    ) -> Self {
        let goal_id = client.new_goal_id();
        debug!("Created task for {}", goal_id);
        Self::new(goal_id, goal, client, events, None, None)
    }

    /// Hands the goal to the transport without waiting for the answer
    pub async fn submit(mut self) -> Result<GoalTask<Submitted>, TeleopError> {
        let pending = self
            .client
            .send_goal_with_id(self.goal_id, self.goal.clone())
            .await?;
        self.pending = Some(pending);
        Ok(self.transition())
    }
}

impl GoalTask<Submitted> {
    pub async fn await_response(mut self) -> Result<GoalResponse, TeleopError> {
        let pending = self.pending.take().ok_or_else(|| {
            TeleopError::InvalidTransition(format!("{} submitted without a request", self.goal_id))
        })?;
        let handle = pending.response().await?;
        let accepted = handle.accepted();
        report(
            &self.events,
            self.goal_id,
            GoalEventKind::Response { accepted },
        )
        .await;

        if accepted {
            self.handle = Some(handle);
            Ok(GoalResponse::Accepted(self.transition()))
        } else {
            Ok(GoalResponse::Rejected(self.transition()))
        }
    }

    /// Drives the goal to a terminal state
    pub async fn run(self) {
        let goal_id = self.goal_id;
        let events = self.events.clone();

        let accepted = match self.await_response().await {
            Ok(GoalResponse::Accepted(accepted)) => accepted,
            Ok(GoalResponse::Rejected(_)) => {
                debug!("{} finished as rejected", goal_id);
                return;
            }
            Err(e) => {
                error!("{} lost before a response: {}", goal_id, e);
                report(&events, goal_id, GoalEventKind::Failed(e.to_string())).await;
                return;
            }
        };

        match accepted.follow().await {
            Ok(resolved) => debug!("{} resolved as {:?}", goal_id, resolved.outcome()),
            Err(e) => error!("{} could not be followed: {}", goal_id, e),
        }
    }
}

impl GoalTask<Accepted> {
    /// Forwards feedback until the result arrives
    ///
    /// A transport failure after acceptance resolves the goal as aborted.
    pub async fn follow(mut self) -> Result<GoalTask<Resolved>, TeleopError> {
        let mut handle = self.handle.take().ok_or_else(|| {
            TeleopError::InvalidTransition(format!("{} accepted without a handle", self.goal_id))
        })?;

        let result = match handle.request_result().await {
            Ok(mut result_receiver) => {
                let mut feedback_open = true;
                loop {
                    tokio::select! {
                        biased;
                        feedback = handle.next_feedback(), if feedback_open => match feedback {
                            Some(feedback) => {
                                report(&self.events, self.goal_id, GoalEventKind::Feedback(feedback))
                                    .await
                            }
                            None => feedback_open = false,
                        },
                        result = &mut result_receiver => break match result {
                            Ok(result) => result,
                            Err(_) => {
                                warn!("{}", ActionError::ResultDropped(self.goal_id));
                                FollowJointTrajectoryResult::with_code(
                                    FollowJointTrajectoryResult::ABORTED,
                                )
                            }
                        },
                    }
                }
            }
            Err(e) => {
                warn!("Could not request result of {}: {}", self.goal_id, e);
                FollowJointTrajectoryResult::with_code(FollowJointTrajectoryResult::ABORTED)
            }
        };

        report(&self.events, self.goal_id, GoalEventKind::Result(result)).await;
        Ok(self.transition_with(GoalOutcome::from(result)))
    }
}

impl GoalTask<Resolved> {
    pub fn outcome(&self) -> Option<GoalOutcome> {
        self.get_state_data().copied()
    }
}

async fn report(events: &mpsc::Sender<GoalEvent>, goal_id: GoalId, kind: GoalEventKind) {
    if events.send(GoalEvent { goal_id, kind }).await.is_err() {
        debug!("Controller gone, dropping event for {}", goal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{channel, ActionRequest, JointTrajectoryPoint};
    use std::time::Duration;

    fn goal() -> FollowJointTrajectoryGoal {
        FollowJointTrajectoryGoal::single_point("slider_to_cart", 0.4, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn accepted_goal_reports_feedback_then_result() {
        let (client, mut endpoint) = channel("/test/action", 8);
        endpoint.set_ready(true);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let submitted = GoalTask::create(client, goal(), events_tx)
            .submit()
            .await
            .unwrap();
        let goal_id = submitted.goal_id();
        let task = tokio::spawn(submitted.run());

        let Some(ActionRequest::SendGoal {
            response, feedback, ..
        }) = endpoint.recv().await
        else {
            panic!("expected a goal request");
        };
        response.send(true).unwrap();
        let Some(ActionRequest::GetResult { result, .. }) = endpoint.recv().await else {
            panic!("expected a result request");
        };
        feedback
            .send(FollowJointTrajectoryFeedback {
                desired: JointTrajectoryPoint {
                    positions: vec![0.2],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        drop(feedback);
        result
            .send(FollowJointTrajectoryResult::with_code(
                FollowJointTrajectoryResult::SUCCESSFUL,
            ))
            .unwrap();
        task.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            assert_eq!(event.goal_id, goal_id);
            kinds.push(event.kind);
        }
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[0], GoalEventKind::Response { accepted: true }));
        assert!(matches!(&kinds[1], GoalEventKind::Feedback(f) if f.desired.positions == vec![0.2]));
        assert!(matches!(kinds[2], GoalEventKind::Result(r) if r.error_code == 0));
    }

    #[tokio::test]
    async fn rejected_goal_never_requests_a_result() {
        let (client, mut endpoint) = channel("/test/action", 8);
        endpoint.set_ready(true);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let submitted = GoalTask::create(client, goal(), events_tx)
            .submit()
            .await
            .unwrap();
        let task = tokio::spawn(submitted.run());

        let Some(ActionRequest::SendGoal { response, .. }) = endpoint.recv().await else {
            panic!("expected a goal request");
        };
        response.send(false).unwrap();
        task.await.unwrap();

        let event = events_rx.try_recv().unwrap();
        assert!(matches!(event.kind, GoalEventKind::Response { accepted: false }));
        assert!(events_rx.try_recv().is_err());
        // no result request reaches the server
        assert!(matches!(
            tokio::time::timeout(Duration::from_millis(50), endpoint.recv()).await,
            Err(_) | Ok(None)
        ));
    }

    #[tokio::test]
    async fn server_dropping_result_resolves_as_aborted() {
        let (client, mut endpoint) = channel("/test/action", 8);
        endpoint.set_ready(true);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let submitted = GoalTask::create(client, goal(), events_tx)
            .submit()
            .await
            .unwrap();
        let task = tokio::spawn(submitted.run());

        let Some(ActionRequest::SendGoal { response, .. }) = endpoint.recv().await else {
            panic!("expected a goal request");
        };
        response.send(true).unwrap();
        let Some(ActionRequest::GetResult { result, .. }) = endpoint.recv().await else {
            panic!("expected a result request");
        };
        drop(result);
        task.await.unwrap();

        let _response = events_rx.try_recv().unwrap();
        let resolved = events_rx.try_recv().unwrap();
        assert!(matches!(
            resolved.kind,
            GoalEventKind::Result(r) if GoalOutcome::from(r) == GoalOutcome::Aborted
        ));
    }

    #[tokio::test]
    async fn feedback_after_the_result_is_discarded() {
        let (client, mut endpoint) = channel("/test/action", 8);
        endpoint.set_ready(true);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let submitted = GoalTask::create(client, goal(), events_tx)
            .submit()
            .await
            .unwrap();
        let task = tokio::spawn(submitted.run());

        let Some(ActionRequest::SendGoal {
            response, feedback, ..
        }) = endpoint.recv().await
        else {
            panic!("expected a goal request");
        };
        response.send(true).unwrap();
        let Some(ActionRequest::GetResult { result, .. }) = endpoint.recv().await else {
            panic!("expected a result request");
        };
        result
            .send(FollowJointTrajectoryResult::with_code(
                FollowJointTrajectoryResult::SUCCESSFUL,
            ))
            .unwrap();
        task.await.unwrap();

        let late = FollowJointTrajectoryFeedback {
            desired: JointTrajectoryPoint {
                positions: vec![0.9],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(feedback.send(late).await.is_err());

        let mut kinds = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], GoalEventKind::Response { accepted: true }));
        assert!(matches!(kinds[1], GoalEventKind::Result(r) if r.error_code == 0));
    }

    #[tokio::test]
    async fn dropped_response_is_reported_as_failure() {
        let (client, mut endpoint) = channel("/test/action", 8);
        endpoint.set_ready(true);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let submitted = GoalTask::create(client, goal(), events_tx)
            .submit()
            .await
            .unwrap();
        let task = tokio::spawn(submitted.run());

        let Some(ActionRequest::SendGoal { response, .. }) = endpoint.recv().await else {
            panic!("expected a goal request");
        };
        drop(response);
        task.await.unwrap();

        let event = events_rx.try_recv().unwrap();
        assert!(matches!(event.kind, GoalEventKind::Failed(_)));
    }
}
