//! FollowJointTrajectory message types
//!
//! Goal, feedback and result payloads exchanged between the teleop controller
//! and a trajectory-following action server.

use std::fmt;
use std::time::Duration;

/// Monotonic identifier assigned by the client when a goal is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GoalId(pub u64);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "goal#{}", self.0)
    }
}

/// A target joint configuration plus the time by which it should be reached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointTrajectoryPoint {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
    pub time_from_start: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointTrajectory {
    pub joint_names: Vec<String>,
    pub points: Vec<JointTrajectoryPoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowJointTrajectoryGoal {
    pub trajectory: JointTrajectory,
}

impl FollowJointTrajectoryGoal {
    /// Single-joint, single-point goal
    pub fn single_point(joint_name: &str, position: f64, time_from_start: Duration) -> Self {
        Self {
            trajectory: JointTrajectory {
                joint_names: vec![joint_name.to_string()],
                points: vec![JointTrajectoryPoint {
                    positions: vec![position],
                    velocities: Vec::new(),
                    time_from_start,
                }],
            },
        }
    }
}

/// Progress report streamed while a goal executes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowJointTrajectoryFeedback {
    pub joint_names: Vec<String>,
    pub desired: JointTrajectoryPoint,
    pub actual: JointTrajectoryPoint,
    pub error: JointTrajectoryPoint,
}

/// Terminal result of a goal, carrying the server's error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowJointTrajectoryResult {
    pub error_code: i32,
}

impl FollowJointTrajectoryResult {
    pub const SUCCESSFUL: i32 = 0;
    pub const INVALID_GOAL: i32 = -1;
    pub const INVALID_JOINTS: i32 = -2;
    pub const OLD_HEADER_TIMESTAMP: i32 = -3;
    pub const PATH_TOLERANCE_VIOLATED: i32 = -4;
    pub const GOAL_TOLERANCE_VIOLATED: i32 = -5;
    pub const ABORTED: i32 = -6;
    pub const CANCELED: i32 = -7;

    pub fn with_code(error_code: i32) -> Self {
        Self { error_code }
    }
}

/// Classification of a terminal result code
///
/// Every `i32` maps to exactly one variant; codes without a dedicated variant
/// land in `Unknown` and keep the raw value for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GoalOutcome {
    #[default]
    Successful,
    Aborted,
    Canceled,
    Unknown(i32),
}

impl GoalOutcome {
    pub fn from_code(error_code: i32) -> Self {
        match error_code {
            FollowJointTrajectoryResult::SUCCESSFUL => GoalOutcome::Successful,
            FollowJointTrajectoryResult::ABORTED => GoalOutcome::Aborted,
            FollowJointTrajectoryResult::CANCELED => GoalOutcome::Canceled,
            other => GoalOutcome::Unknown(other),
        }
    }

    /// Line logged when a goal resolves with this outcome
    pub fn log_message(&self) -> &'static str {
        match self {
            GoalOutcome::Successful => "SUCCEEDED result code",
            GoalOutcome::Aborted => "Goal was aborted",
            GoalOutcome::Canceled => "Goal was canceled",
            GoalOutcome::Unknown(_) => "Unknown result code",
        }
    }
}

impl From<FollowJointTrajectoryResult> for GoalOutcome {
    fn from(result: FollowJointTrajectoryResult) -> Self {
        GoalOutcome::from_code(result.error_code)
    }
}
