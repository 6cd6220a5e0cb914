// Fixed-timestep motion model for the simulated robot
//
// Each velocity channel (drive speed, turn rate, two arm speeds) runs an
// independent jerk-limited acceleration profile toward its target, then the
// drive channels integrate into position/heading and the arm channels into
// joint angles. Pure state update, no I/O: out-of-range inputs clamp.

use crate::command::WireCommand;

/// Simulation timestep in seconds (50 Hz tick)
pub const DT: f64 = 0.02;

// Proportional gain from velocity error to commanded acceleration
const CONTROL_GAIN: f64 = 15.0;
// Jerk cap as a multiple of the channel's max acceleration
const JERK_LIMIT_RATIO: f64 = 8.0;

// Per-channel acceleration ceilings (device units / s^2)
const MAX_DRIVE_ACCEL: f64 = 800.0;
const MAX_TURN_ACCEL: f64 = 600.0;
const MAX_ARM_ACCEL: f64 = 1000.0;

const FRICTION_COEFF: f64 = 0.05;
const MOTOR_LAG: f64 = 0.03;
const INERTIAL_DAMPING: f64 = 0.995;

const ROBOT_MASS: f64 = 2.5;
const ROBOT_INERTIA: f64 = 0.12;
const ARM_INERTIA: f64 = 0.05;

// Gains applied once at command intake, not inside the integrator
const DRIVE_INTAKE_GAIN: f64 = 1.5;
const TURN_INTAKE_GAIN: f64 = 1.2;

// Device-unit velocities to workspace units
const SPEED_GAIN: f64 = 0.15;
const TURN_GAIN: f64 = 0.8;
const ARM_GAIN: f64 = 0.3;

const DRIVE_DEADBAND: f64 = 0.01;
const ARM_DEADBAND: f64 = 0.1;

const WORKSPACE_MARGIN: f64 = 30.0;
const ARM_LIMIT_DEG: f64 = 90.0;

/// Read-only snapshot of the simulated robot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RobotState {
    pub x: f64,
    pub y: f64,
    pub heading: f64, // degrees
    pub arm1_angle: f64,
    pub arm2_angle: f64,
    pub speed: f64,
    pub turn_rate: f64,
    pub arm1_speed: f64,
    pub arm2_speed: f64,
}

/// One velocity channel with its jerk-limited acceleration state
#[derive(Debug, Clone, Copy)]
struct Channel {
    target: f64,
    actual: f64,
    accel: f64,
    max_accel: f64,
}

impl Channel {
    fn new(max_accel: f64) -> Self {
        Self { target: 0.0, actual: 0.0, accel: 0.0, max_accel }
    }

    fn reset(&mut self) {
        self.target = 0.0;
        self.actual = 0.0;
        self.accel = 0.0;
    }

    fn tick(&mut self) {
        let error = self.target - self.actual;

        let target_accel = (error * CONTROL_GAIN).clamp(-self.max_accel, self.max_accel);
        let accel_error = target_accel - self.accel;
        let max_jerk_change = self.max_accel * JERK_LIMIT_RATIO * DT;
        let mut accel = if accel_error.abs() > max_jerk_change {
            self.accel + max_jerk_change.copysign(accel_error)
        } else {
            target_accel
        };

        // Friction plus error-dependent damping: near-zero error settles tighter
        let friction = 1.0 - FRICTION_COEFF * DT;
        let damping = 0.92 + 0.08 * (-error.abs() * 0.1).exp();
        accel *= friction * damping;

        self.accel = accel;
        self.actual += accel * DT * (1.0 - MOTOR_LAG);
        self.actual *= INERTIAL_DAMPING;
    }
}

/// Simulated robot: pose, arm angles and the four velocity channels
pub struct PhysicsEngine {
    width: f64,
    height: f64,
    x: f64,
    y: f64,
    heading: f64,
    arm1_angle: f64,
    arm2_angle: f64,
    speed: Channel,
    turn: Channel,
    arm1: Channel,
    arm2: Channel,
}

impl PhysicsEngine {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            x: width / 2.0,
            y: height / 2.0,
            heading: 0.0,
            arm1_angle: 0.0,
            arm2_angle: 0.0,
            speed: Channel::new(MAX_DRIVE_ACCEL),
            turn: Channel::new(MAX_TURN_ACCEL),
            arm1: Channel::new(MAX_ARM_ACCEL),
            arm2: Channel::new(MAX_ARM_ACCEL),
        }
    }

    /// Update channel targets from a wire command
    pub fn apply(&mut self, cmd: &WireCommand) {
        match *cmd {
            WireCommand::Drive { speed, turn_rate } => {
                self.speed.target = speed * DRIVE_INTAKE_GAIN;
                self.turn.target = turn_rate * TURN_INTAKE_GAIN;
            }
            WireCommand::Arm1 { speed } => self.arm1.target = speed,
            WireCommand::Arm2 { speed } => self.arm2.target = speed,
        }
    }

    /// Advance the simulation by one fixed timestep
    pub fn tick(&mut self) {
        self.speed.tick();
        self.turn.tick();
        self.arm1.tick();
        self.arm2.tick();
        self.integrate_pose();
        self.integrate_arms();
    }

    fn integrate_pose(&mut self) {
        if self.speed.actual.abs() <= DRIVE_DEADBAND && self.turn.actual.abs() <= DRIVE_DEADBAND {
            return;
        }

        let sim_speed = self.speed.actual * SPEED_GAIN;
        let sim_turn = self.turn.actual * TURN_GAIN;

        let momentum = 1.0 / (1.0 + ROBOT_MASS * 0.1);
        let inertia = 1.0 / (1.0 + ROBOT_INERTIA * 2.0);

        self.heading = (self.heading + sim_turn * DT * inertia) % 360.0;

        let rad = self.heading.to_radians();
        self.x += sim_speed * rad.cos() * DT * momentum;
        self.y += sim_speed * rad.sin() * DT * momentum;

        self.x = self.x.clamp(WORKSPACE_MARGIN, self.width - WORKSPACE_MARGIN);
        self.y = self.y.clamp(WORKSPACE_MARGIN, self.height - WORKSPACE_MARGIN);
    }

    fn integrate_arms(&mut self) {
        let momentum = 1.0 / (1.0 + ARM_INERTIA * 0.8);
        if self.arm1.actual.abs() > ARM_DEADBAND {
            self.arm1_angle = (self.arm1_angle + self.arm1.actual * ARM_GAIN * DT * momentum)
                .clamp(-ARM_LIMIT_DEG, ARM_LIMIT_DEG);
        }
        if self.arm2.actual.abs() > ARM_DEADBAND {
            self.arm2_angle = (self.arm2_angle + self.arm2.actual * ARM_GAIN * DT * momentum)
                .clamp(-ARM_LIMIT_DEG, ARM_LIMIT_DEG);
        }
    }

    /// Put the robot back in the middle of the workspace, at rest
    pub fn reset(&mut self) {
        self.x = self.width / 2.0;
        self.y = self.height / 2.0;
        self.heading = 0.0;
        self.arm1_angle = 0.0;
        self.arm2_angle = 0.0;
        self.speed.reset();
        self.turn.reset();
        self.arm1.reset();
        self.arm2.reset();
    }

    pub fn state(&self) -> RobotState {
        RobotState {
            x: self.x,
            y: self.y,
            heading: self.heading,
            arm1_angle: self.arm1_angle,
            arm2_angle: self.arm2_angle,
            speed: self.speed.actual,
            turn_rate: self.turn.actual,
            arm1_speed: self.arm1.actual,
            arm2_speed: self.arm2.actual,
        }
    }
}
