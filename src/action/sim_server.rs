//! Simulated single-joint trajectory server
//!
//! Serves the FollowJointTrajectory action for one prismatic joint. Accepted
//! goals are executed by linear interpolation from the current position to
//! the goal's single target point, with feedback published on every tick.
//!
//! # Goal lifecycle
//!
//! ```text
//! SendGoal ──► validate ──► rejected (response=false)
//!                  │
//!                  └──► accepted ──► executing ──► SUCCESSFUL
//!                                       │
//!                                       ├──► CANCELED (preempted by a newer goal)
//!                                       └──► ABORTED  (server shutdown)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{ActionRequest, ActionServerEndpoint};
use super::messages::{
    FollowJointTrajectoryFeedback, FollowJointTrajectoryGoal, FollowJointTrajectoryResult, GoalId,
    JointTrajectoryPoint,
};
use crate::config::SimulationConfig;

/// Finished results kept for late `GetResult` requests
const RESULT_HISTORY: usize = 256;

struct ActiveGoal {
    goal_id: GoalId,
    start_position: f64,
    target_position: f64,
    duration: Duration,
    started: Instant,
    feedback: mpsc::Sender<FollowJointTrajectoryFeedback>,
    result_waiters: Vec<oneshot::Sender<FollowJointTrajectoryResult>>,
}

impl ActiveGoal {
    /// Completed fraction of the motion
    fn progress(&self) -> f64 {
        if self.duration.is_zero() {
            1.0
        } else {
            (self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
        }
    }

    fn position_at(&self, fraction: f64) -> f64 {
        self.start_position + (self.target_position - self.start_position) * fraction
    }
}

pub struct TrajectoryServer {
    endpoint: ActionServerEndpoint,
    settings: SimulationConfig,
    position: f64,
    position_sender: watch::Sender<f64>,
    active: Option<ActiveGoal>,
    finished: BTreeMap<GoalId, FollowJointTrajectoryResult>,
}

impl TrajectoryServer {
    pub fn new(endpoint: ActionServerEndpoint, settings: SimulationConfig) -> Self {
        let position = settings
            .initial_position
            .clamp(settings.lower_limit, settings.upper_limit);
        let (position_sender, _) = watch::channel(position);
        Self {
            endpoint,
            settings,
            position,
            position_sender,
            active: None,
            finished: BTreeMap::new(),
        }
    }

    /// Current simulated joint position
    pub fn joint_state(&self) -> watch::Receiver<f64> {
        self.position_sender.subscribe()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Trajectory server {} serving joint {} in [{}, {}]",
            self.endpoint.action_name(),
            self.settings.joint_name,
            self.settings.lower_limit,
            self.settings.upper_limit
        );
        self.endpoint.set_ready(true);

        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.settings.feedback_period_ms.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Trajectory server shutting down");
                    break;
                }
                request = self.endpoint.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        info!("All action clients are gone, stopping trajectory server");
                        break;
                    }
                },
                _ = ticker.tick(), if self.active.is_some() => self.step(),
            }
        }

        self.endpoint.set_ready(false);
        if let Some(active) = self.active.take() {
            warn!("Aborting {} on shutdown", active.goal_id);
            self.finish(active, FollowJointTrajectoryResult::ABORTED);
        }
    }

    fn handle_request(&mut self, request: ActionRequest) {
        match request {
            ActionRequest::SendGoal {
                goal_id,
                goal,
                response,
                feedback,
            } => {
                let (target_position, duration) = match self.validate(&goal) {
                    Ok(target) => target,
                    Err(code) => {
                        info!("Rejecting {} with error code {}", goal_id, code);
                        if response.send(false).is_err() {
                            debug!("Client of {} left before the rejection", goal_id);
                        }
                        return;
                    }
                };

                if response.send(true).is_err() {
                    warn!("Client of {} left before acceptance, not executing", goal_id);
                    return;
                }

                if let Some(previous) = self.active.take() {
                    info!("{} preempted by {}", previous.goal_id, goal_id);
                    self.set_position(previous.position_at(previous.progress()));
                    self.finish(previous, FollowJointTrajectoryResult::CANCELED);
                }

                debug!(
                    "Executing {}: {:.4} -> {:.4} over {:?}",
                    goal_id, self.position, target_position, duration
                );
                self.active = Some(ActiveGoal {
                    goal_id,
                    start_position: self.position,
                    target_position,
                    duration,
                    started: Instant::now(),
                    feedback,
                    result_waiters: Vec::new(),
                });
            }
            ActionRequest::GetResult { goal_id, result } => {
                if let Some(active) = self.active.as_mut() {
                    if active.goal_id == goal_id {
                        active.result_waiters.push(result);
                        return;
                    }
                }
                let finished = self.finished.remove(&goal_id).unwrap_or_else(|| {
                    warn!("Result requested for unknown {}", goal_id);
                    FollowJointTrajectoryResult::with_code(FollowJointTrajectoryResult::INVALID_GOAL)
                });
                if result.send(finished).is_err() {
                    debug!("Result receiver for {} dropped", goal_id);
                }
            }
        }
    }

    /// Checks a goal against the served joint and returns its final target
    /// position with the time to reach it
    fn validate(&self, goal: &FollowJointTrajectoryGoal) -> Result<(f64, Duration), i32> {
        let trajectory = &goal.trajectory;
        if trajectory.joint_names.len() != 1 || trajectory.joint_names[0] != self.settings.joint_name
        {
            return Err(FollowJointTrajectoryResult::INVALID_JOINTS);
        }
        let Some(point) = trajectory.points.last() else {
            return Err(FollowJointTrajectoryResult::INVALID_GOAL);
        };
        let Some(&target) = point.positions.first() else {
            return Err(FollowJointTrajectoryResult::INVALID_GOAL);
        };
        if !target.is_finite()
            || target < self.settings.lower_limit
            || target > self.settings.upper_limit
        {
            return Err(FollowJointTrajectoryResult::INVALID_GOAL);
        }
        Ok((target, point.time_from_start))
    }

    fn step(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };

        let fraction = active.progress();
        let desired = active.position_at(fraction);
        let previous = self.position;
        self.position = desired;
        self.position_sender.send_replace(desired);

        let feedback = FollowJointTrajectoryFeedback {
            joint_names: vec![self.settings.joint_name.clone()],
            desired: JointTrajectoryPoint {
                positions: vec![desired],
                velocities: Vec::new(),
                time_from_start: active.started.elapsed(),
            },
            actual: JointTrajectoryPoint {
                positions: vec![desired],
                velocities: Vec::new(),
                time_from_start: active.started.elapsed(),
            },
            error: JointTrajectoryPoint {
                positions: vec![desired - previous],
                velocities: Vec::new(),
                time_from_start: Duration::ZERO,
            },
        };
        if let Err(e) = active.feedback.try_send(feedback) {
            debug!("Dropping feedback for {}: {}", active.goal_id, e);
        }

        if fraction >= 1.0 {
            if let Some(active) = self.active.take() {
                info!("{} reached {:.4}", active.goal_id, active.target_position);
                self.finish(active, FollowJointTrajectoryResult::SUCCESSFUL);
            }
        }
    }

    fn set_position(&mut self, position: f64) {
        self.position = position;
        self.position_sender.send_replace(position);
    }

    fn finish(&mut self, active: ActiveGoal, error_code: i32) {
        let result = FollowJointTrajectoryResult::with_code(error_code);
        if active.result_waiters.is_empty() {
            self.finished.insert(active.goal_id, result);
            while self.finished.len() > RESULT_HISTORY {
                self.finished.pop_first();
            }
            return;
        }
        for waiter in active.result_waiters {
            if waiter.send(result).is_err() {
                debug!("Result receiver for {} dropped", active.goal_id);
            }
        }
    }
}

/// Handle to a spawned [`TrajectoryServer`]
pub struct TrajectoryServerHandle {
    shutdown: CancellationToken,
    joint_state: watch::Receiver<f64>,
    task: JoinHandle<()>,
}

impl TrajectoryServerHandle {
    pub fn spawn(endpoint: ActionServerEndpoint, settings: SimulationConfig) -> Self {
        info!("Spawning simulated trajectory server");
        let server = TrajectoryServer::new(endpoint, settings);
        let joint_state = server.joint_state();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            shutdown,
            joint_state,
            task,
        }
    }

    pub fn joint_state(&self) -> watch::Receiver<f64> {
        self.joint_state.clone()
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("Trajectory server task failed: {}", e);
        }
    }
}
