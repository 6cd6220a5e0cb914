// Kinematic simulator used when no hub is connected

mod physics;

pub use physics::{PhysicsEngine, RobotState, DT};
