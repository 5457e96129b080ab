//! Teleop controller - joystick samples to trajectory goals
//!
//! Owns the summary [`ControllerState`] and the per-goal bookkeeping. All
//! handlers take `&mut self` and are driven from a single event loop, so the
//! state needs no locking. Goal tasks run detached in a [`JoinSet`] and talk
//! back through [`GoalEvent`]s.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::TeleopError;
use super::goal_task::{GoalEvent, GoalEventKind, GoalTask};
use crate::action::{
    ActionClient, FollowJointTrajectoryFeedback, FollowJointTrajectoryGoal, GoalId, GoalOutcome,
};
use crate::config::GoalConfig;
use crate::joy::JoyMessage;

/// Goal events buffered between goal tasks and the event loop
const GOAL_EVENT_CAPACITY: usize = 256;
/// Per-goal phases kept for inspection once goals are terminal
const GOAL_HISTORY: usize = 256;

/// Summary of the most recent goal activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub goal_accepted: bool,
    pub last_result: GoalOutcome,
}

/// Lifecycle phase of a single goal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalPhase {
    Submitted,
    Accepted,
    Rejected,
    Resolved(GoalOutcome),
    Lost,
}

impl GoalPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GoalPhase::Submitted | GoalPhase::Accepted)
    }
}

pub struct TeleopController {
    settings: GoalConfig,
    client: ActionClient,
    state: ControllerState,
    state_sender: watch::Sender<ControllerState>,
    goals: BTreeMap<GoalId, GoalPhase>,
    event_sender: mpsc::Sender<GoalEvent>,
    tasks: JoinSet<()>,
}

impl TeleopController {
    /// Creates the controller and the receiver its goal tasks report to
    pub fn new(settings: GoalConfig, client: ActionClient) -> (Self, mpsc::Receiver<GoalEvent>) {
        info!(
            "Creating teleop controller for joint {} on {} (axis {})",
            settings.joint_name,
            client.action_name(),
            settings.axis_index
        );
        let (event_sender, event_receiver) = mpsc::channel(GOAL_EVENT_CAPACITY);
        let state = ControllerState::default();
        let (state_sender, _) = watch::channel(state);

        let controller = Self {
            settings,
            client,
            state,
            state_sender,
            goals: BTreeMap::new(),
            event_sender,
            tasks: JoinSet::new(),
        };
        (controller, event_receiver)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state_sender.subscribe()
    }

    pub fn goal_phase(&self, goal_id: GoalId) -> Option<GoalPhase> {
        self.goals.get(&goal_id).copied()
    }

    pub fn goals_in_flight(&self) -> usize {
        self.goals.values().filter(|p| !p.is_terminal()).count()
    }

    /// Builds the single-point goal for a target position
    pub fn goal_for(&self, position: f64) -> FollowJointTrajectoryGoal {
        FollowJointTrajectoryGoal::single_point(
            &self.settings.joint_name,
            position,
            self.settings.time_from_start(),
        )
    }

    /// Turns a joystick sample into a goal submission
    ///
    /// Returns the id of the submitted goal, or `None` when the sample or the
    /// server made submission impossible. Failures are logged, never raised.
    pub async fn on_input_sample(&mut self, sample: &JoyMessage) -> Option<GoalId> {
        let axis_index = self.settings.axis_index;
        let Some(position) = sample.axis(axis_index) else {
            warn!(
                "{}",
                TeleopError::InvalidSample {
                    axis_index,
                    axis_count: sample.axes.len(),
                }
            );
            return None;
        };

        let goal = self.goal_for(f64::from(position));
        match self.submit_goal(goal).await {
            Ok(goal_id) => Some(goal_id),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    /// Sends a goal once the server is available
    ///
    /// The availability check waits up to the configured timeout and holds up
    /// the caller for that long.
    pub async fn submit_goal(
        &mut self,
        goal: FollowJointTrajectoryGoal,
    ) -> Result<GoalId, TeleopError> {
        let timeout = self.settings.server_timeout();
        if !self.client.wait_for_server(timeout).await {
            return Err(TeleopError::ServerUnavailable {
                action_name: self.client.action_name().to_string(),
                waited: timeout,
            });
        }

        let target = goal
            .trajectory
            .points
            .first()
            .and_then(|p| p.positions.first())
            .copied()
            .unwrap_or_default();

        let task = GoalTask::create(self.client.clone(), goal, self.event_sender.clone());
        let goal_id = task.goal_id();
        info!("Sending goal: {}", target);
        let submitted = task.submit().await?;

        self.track(goal_id, GoalPhase::Submitted);
        self.tasks.spawn(submitted.run());
        debug!("{} submitted, {} in flight", goal_id, self.goals_in_flight());
        Ok(goal_id)
    }

    pub fn handle_goal_event(&mut self, event: GoalEvent) {
        let GoalEvent { goal_id, kind } = event;
        match kind {
            GoalEventKind::Response { accepted } => self.on_goal_response(goal_id, accepted),
            GoalEventKind::Feedback(feedback) => self.on_feedback(goal_id, &feedback),
            GoalEventKind::Result(result) => self.on_result(goal_id, result.error_code),
            GoalEventKind::Failed(reason) => {
                error!("{} failed: {}", goal_id, reason);
                self.track(goal_id, GoalPhase::Lost);
            }
        }
        self.reap_tasks();
    }

    pub fn on_goal_response(&mut self, goal_id: GoalId, accepted: bool) {
        if accepted {
            info!("Goal accepted");
            debug!("{} accepted", goal_id);
            self.state.goal_accepted = true;
            self.track(goal_id, GoalPhase::Accepted);
        } else {
            info!("Goal rejected");
            debug!("{} rejected", goal_id);
            self.state.goal_accepted = false;
            self.track(goal_id, GoalPhase::Rejected);
        }
        self.publish_state();
    }

    pub fn on_feedback(&self, goal_id: GoalId, feedback: &FollowJointTrajectoryFeedback) {
        debug!("Feedback for {}", goal_id);
        info!(
            "Feedback received. Current Positions: {:?}",
            feedback.desired.positions
        );
    }

    pub fn on_result(&mut self, goal_id: GoalId, error_code: i32) {
        if let Some(GoalPhase::Resolved(previous)) = self.goal_phase(goal_id) {
            warn!(
                "Ignoring second result for {} (already {:?})",
                goal_id, previous
            );
            return;
        }

        let outcome = GoalOutcome::from_code(error_code);
        self.state.last_result = outcome;
        self.track(goal_id, GoalPhase::Resolved(outcome));
        info!("{}", outcome.log_message());
        debug!("{} resolved with error code {}", goal_id, error_code);
        self.publish_state();
    }

    /// Aborts all goal tasks still running
    pub async fn shutdown(&mut self) {
        let in_flight = self.goals_in_flight();
        if in_flight > 0 {
            warn!("Shutting down with {} goals in flight", in_flight);
        }
        self.tasks.shutdown().await;
    }

    fn track(&mut self, goal_id: GoalId, phase: GoalPhase) {
        self.goals.insert(goal_id, phase);
        while self.goals.len() > GOAL_HISTORY {
            self.goals.pop_first();
        }
    }

    fn publish_state(&self) {
        self.state_sender.send_replace(self.state);
    }

    fn reap_tasks(&mut self) {
        while let Some(finished) = self.tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Goal task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        channel, ActionRequest, ActionServerEndpoint, FollowJointTrajectoryResult,
        JointTrajectoryPoint,
    };
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (buffer, guard)
    }

    fn setup() -> (TeleopController, mpsc::Receiver<GoalEvent>, ActionServerEndpoint) {
        let (client, endpoint) = channel("/test/follow_joint_trajectory", 16);
        let (controller, events) = TeleopController::new(GoalConfig::default(), client);
        (controller, events, endpoint)
    }

    async fn next_request(endpoint: &mut ActionServerEndpoint) -> ActionRequest {
        endpoint.recv().await.expect("client side closed")
    }

    async fn no_request(endpoint: &mut ActionServerEndpoint) -> bool {
        tokio::time::timeout(Duration::from_millis(100), endpoint.recv())
            .await
            .is_err()
    }

    async fn pump(controller: &mut TeleopController, events: &mut mpsc::Receiver<GoalEvent>) {
        let event = events.recv().await.expect("event channel closed");
        controller.handle_goal_event(event);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_becomes_single_point_goal() {
        let (mut controller, _events, mut endpoint) = setup();
        endpoint.set_ready(true);

        let sample = JoyMessage::from_axes(vec![0.0, 0.75]);
        let goal_id = controller.on_input_sample(&sample).await.unwrap();

        let ActionRequest::SendGoal {
            goal_id: sent_id,
            goal,
            ..
        } = next_request(&mut endpoint).await
        else {
            panic!("expected a goal request");
        };
        assert_eq!(sent_id, goal_id);
        assert_eq!(goal.trajectory.joint_names, vec!["slider_to_cart".to_string()]);
        assert_eq!(goal.trajectory.points.len(), 1);
        assert_eq!(goal.trajectory.points[0].positions, vec![0.75]);
        assert_eq!(
            goal.trajectory.points[0].time_from_start,
            Duration::from_secs(1)
        );
        assert_eq!(controller.goal_phase(goal_id), Some(GoalPhase::Submitted));
    }

    #[tokio::test(start_paused = true)]
    async fn position_is_axis_one_exactly() {
        let (mut controller, _events, mut endpoint) = setup();
        endpoint.set_ready(true);

        for value in [-1.0f32, -0.333_333_34, 0.0, 0.1, 0.987_654_3, 1.0] {
            let sample = JoyMessage::from_axes(vec![0.5, value, -0.25]);
            controller.on_input_sample(&sample).await.unwrap();
            let ActionRequest::SendGoal { goal, .. } = next_request(&mut endpoint).await else {
                panic!("expected a goal request");
            };
            assert_eq!(goal.trajectory.points[0].positions, vec![f64::from(value)]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_server_drops_the_goal() {
        let (logs, _guard) = capture_logs();
        let (mut controller, mut events, mut endpoint) = setup();

        let started = tokio::time::Instant::now();
        let sample = JoyMessage::from_axes(vec![0.0, 0.5]);
        assert_eq!(controller.on_input_sample(&sample).await, None);
        assert!(started.elapsed() >= Duration::from_secs(2));

        assert!(no_request(&mut endpoint).await);
        assert!(events.try_recv().is_err());
        assert_eq!(controller.goals_in_flight(), 0);
        assert_eq!(controller.state(), ControllerState::default());
        assert!(logs
            .contents()
            .contains("Action server not available after waiting"));
        assert!(!logs.contents().contains("Sending goal"));
    }

    #[tokio::test(start_paused = true)]
    async fn short_sample_is_dropped() {
        let (mut controller, _events, mut endpoint) = setup();
        endpoint.set_ready(true);

        let sample = JoyMessage::from_axes(vec![0.3]);
        assert_eq!(controller.on_input_sample(&sample).await, None);
        assert!(no_request(&mut endpoint).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_goal_clears_acceptance_and_gets_no_result() {
        let (logs, _guard) = capture_logs();
        let (mut controller, mut events, mut endpoint) = setup();
        endpoint.set_ready(true);
        controller.on_goal_response(GoalId(999), true);
        assert!(controller.state().goal_accepted);

        let goal_id = controller
            .on_input_sample(&JoyMessage::from_axes(vec![0.0, 0.2]))
            .await
            .unwrap();
        let ActionRequest::SendGoal { response, .. } = next_request(&mut endpoint).await else {
            panic!("expected a goal request");
        };
        response.send(false).unwrap();
        pump(&mut controller, &mut events).await;

        assert!(!controller.state().goal_accepted);
        assert_eq!(controller.goal_phase(goal_id), Some(GoalPhase::Rejected));
        assert!(no_request(&mut endpoint).await);
        assert!(events.try_recv().is_err());
        assert!(logs.contents().contains("Goal rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_goal_records_successful_result() {
        let (logs, _guard) = capture_logs();
        let (mut controller, mut events, mut endpoint) = setup();
        endpoint.set_ready(true);
        let state = controller.subscribe();

        let goal_id = controller
            .on_input_sample(&JoyMessage::from_axes(vec![0.0, 0.75]))
            .await
            .unwrap();
        let ActionRequest::SendGoal {
            response, feedback, ..
        } = next_request(&mut endpoint).await
        else {
            panic!("expected a goal request");
        };
        response.send(true).unwrap();
        pump(&mut controller, &mut events).await;
        assert!(controller.state().goal_accepted);
        assert_eq!(controller.goal_phase(goal_id), Some(GoalPhase::Accepted));

        let ActionRequest::GetResult {
            goal_id: requested,
            result,
        } = next_request(&mut endpoint).await
        else {
            panic!("expected a result request");
        };
        assert_eq!(requested, goal_id);

        feedback
            .send(FollowJointTrajectoryFeedback {
                desired: JointTrajectoryPoint {
                    positions: vec![0.375],
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        pump(&mut controller, &mut events).await;
        drop(feedback);

        result
            .send(FollowJointTrajectoryResult::with_code(
                FollowJointTrajectoryResult::SUCCESSFUL,
            ))
            .unwrap();
        pump(&mut controller, &mut events).await;

        assert_eq!(controller.state().last_result, GoalOutcome::Successful);
        assert_eq!(
            controller.goal_phase(goal_id),
            Some(GoalPhase::Resolved(GoalOutcome::Successful))
        );
        assert_eq!(*state.borrow(), controller.state());

        let logs = logs.contents();
        assert!(logs.contains("Sending goal: 0.75"));
        assert!(logs.contains("Goal accepted"));
        assert!(logs.contains("Feedback received. Current Positions: [0.375]"));
        assert!(logs.contains("SUCCEEDED result code"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_result_code_is_classified_unknown() {
        let (logs, _guard) = capture_logs();
        let (mut controller, mut events, mut endpoint) = setup();
        endpoint.set_ready(true);

        let goal_id = controller
            .on_input_sample(&JoyMessage::from_axes(vec![0.0, -0.4]))
            .await
            .unwrap();
        let ActionRequest::SendGoal { response, .. } = next_request(&mut endpoint).await else {
            panic!("expected a goal request");
        };
        response.send(true).unwrap();
        pump(&mut controller, &mut events).await;
        let ActionRequest::GetResult { result, .. } = next_request(&mut endpoint).await else {
            panic!("expected a result request");
        };
        result.send(FollowJointTrajectoryResult::with_code(42)).unwrap();
        pump(&mut controller, &mut events).await;

        assert_eq!(controller.state().last_result, GoalOutcome::Unknown(42));
        assert_eq!(
            controller.goal_phase(goal_id),
            Some(GoalPhase::Resolved(GoalOutcome::Unknown(42)))
        );
        assert!(logs.contents().contains("Unknown result code"));
    }

    #[tokio::test(start_paused = true)]
    async fn goal_lost_before_response_leaves_nothing_in_flight() {
        let (logs, _guard) = capture_logs();
        let (mut controller, mut events, mut endpoint) = setup();
        endpoint.set_ready(true);

        let goal_id = controller
            .on_input_sample(&JoyMessage::from_axes(vec![0.0, 0.1]))
            .await
            .unwrap();
        assert_eq!(controller.goals_in_flight(), 1);
        let ActionRequest::SendGoal { response, .. } = next_request(&mut endpoint).await else {
            panic!("expected a goal request");
        };
        drop(response);
        pump(&mut controller, &mut events).await;

        assert_eq!(controller.goal_phase(goal_id), Some(GoalPhase::Lost));
        assert_eq!(controller.goals_in_flight(), 0);
        assert_eq!(controller.state(), ControllerState::default());
        assert!(logs.contents().contains(&format!("{} failed", goal_id)));
    }

    #[test]
    fn aborted_and_canceled_results_are_logged() {
        let (logs, _guard) = capture_logs();
        let (client, _endpoint) = channel("/test/follow_joint_trajectory", 4);
        let (mut controller, _events) = TeleopController::new(GoalConfig::default(), client);

        controller.on_result(GoalId(1), FollowJointTrajectoryResult::ABORTED);
        assert_eq!(controller.state().last_result, GoalOutcome::Aborted);
        controller.on_result(GoalId(2), FollowJointTrajectoryResult::CANCELED);
        assert_eq!(controller.state().last_result, GoalOutcome::Canceled);

        let logs = logs.contents();
        assert!(logs.contains("Goal was aborted"));
        assert!(logs.contains("Goal was canceled"));
    }

    #[test]
    fn only_the_first_result_of_a_goal_counts() {
        let (client, _endpoint) = channel("/test/follow_joint_trajectory", 4);
        let (mut controller, _events) = TeleopController::new(GoalConfig::default(), client);

        controller.on_goal_response(GoalId(7), true);
        controller.on_result(GoalId(7), FollowJointTrajectoryResult::CANCELED);
        controller.on_result(GoalId(7), FollowJointTrajectoryResult::SUCCESSFUL);

        assert_eq!(controller.state().last_result, GoalOutcome::Canceled);
        assert_eq!(
            controller.goal_phase(GoalId(7)),
            Some(GoalPhase::Resolved(GoalOutcome::Canceled))
        );
    }
}
