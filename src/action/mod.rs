//! FollowJointTrajectory action plumbing
//!
//! ```text
//! TeleopController ──► ActionClient ══(tokio channels)══► ActionServerEndpoint ──► TrajectoryServer
//! ```

pub mod client;
pub mod messages;
pub mod sim_server;

pub use client::{
    channel, ActionClient, ActionError, ActionRequest, ActionServerEndpoint, GoalHandle,
    PendingGoal,
};
pub use messages::{
    FollowJointTrajectoryFeedback, FollowJointTrajectoryGoal, FollowJointTrajectoryResult, GoalId,
    GoalOutcome, JointTrajectory, JointTrajectoryPoint,
};
pub use sim_server::TrajectoryServerHandle;
