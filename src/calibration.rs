// Guided calibration: a six-step state machine that probes the robot
// (simulated or real), derives correction factors and scores the run.
//
// There are no hidden timers: the machine stores deadlines and `poll`
// fires whatever has come due, so the control loop drives it at 50 Hz
// and tests drive it with synthetic instants.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::command::Command;
use crate::config::{
    INTER_STEP_DELAY, MAX_STEP_ATTEMPTS, PROBE_DRIVE_SPEED, PROBE_TURN_RATE, QUALITY_THRESHOLD,
    RETRY_DELAY, STEP_START_DELAY, STEP_TIMEOUT_HW, STEP_TIMEOUT_SIM,
};
use crate::dispatch::Dispatcher;
use crate::robot_config::RobotConfig;

/// Calibration sequence, strictly ordered; steps never skip or reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    NotStarted,
    MotorResponseTime,
    StraightTracking,
    TurnAccuracy,
    Gyroscope,
    MotorBalance,
    Finalization,
    Completed,
}

/// Outcome of one calibration step
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub success: bool,
    pub step_name: String,
    pub measured_value: f64,
    pub units: String,
    pub description: String,
    pub confidence: f64,
}

/// Events surfaced to the console while a run progresses
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Started,
    StepChanged { step: CalibrationStep, description: String },
    Progress(u8),
    StepCompleted(CalibrationResult),
    Completed(RobotConfig),
    Failed(String),
}

/// Static per-step metadata: the sequence, retry policy and display data
/// are table entries rather than branching logic.
struct StepSpec {
    step: CalibrationStep,
    name: &'static str,
    units: &'static str,
    description: &'static str,
    progress: u8,
    next: CalibrationStep,
}

const STEP_TABLE: [StepSpec; 5] = [
    StepSpec {
        step: CalibrationStep::MotorResponseTime,
        name: "Motor Response Time",
        units: "ms",
        description: "Testing motor response time...",
        progress: 10,
        next: CalibrationStep::StraightTracking,
    },
    StepSpec {
        step: CalibrationStep::StraightTracking,
        name: "Straight Tracking",
        units: "deg",
        description: "Testing straight line tracking...",
        progress: 30,
        next: CalibrationStep::TurnAccuracy,
    },
    StepSpec {
        step: CalibrationStep::TurnAccuracy,
        name: "Turn Accuracy",
        units: "factor",
        description: "Testing turn accuracy...",
        progress: 50,
        next: CalibrationStep::Gyroscope,
    },
    StepSpec {
        step: CalibrationStep::Gyroscope,
        name: "Gyroscope Drift",
        units: "deg/s",
        description: "Calibrating gyroscope...",
        progress: 70,
        next: CalibrationStep::MotorBalance,
    },
    StepSpec {
        step: CalibrationStep::MotorBalance,
        name: "Motor Balance",
        units: "factor",
        description: "Testing motor balance...",
        progress: 85,
        next: CalibrationStep::Finalization,
    },
];

fn step_spec(step: CalibrationStep) -> Option<&'static StepSpec> {
    STEP_TABLE.iter().find(|spec| spec.step == step)
}

/// Timed probe for the hardware path: what to send, when to stop it,
/// and when to run the analysis.
struct ProbePlan {
    command: Option<Command>,
    stop_after: Option<Duration>,
    analyze_after: Duration,
}

fn probe_plan(step: CalibrationStep) -> ProbePlan {
    match step {
        CalibrationStep::MotorResponseTime => ProbePlan {
            command: Some(Command::Drive { speed: PROBE_DRIVE_SPEED, turn_rate: 0.0 }),
            stop_after: Some(Duration::from_millis(200)),
            analyze_after: Duration::from_millis(500),
        },
        CalibrationStep::StraightTracking => ProbePlan {
            command: Some(Command::Drive { speed: PROBE_DRIVE_SPEED, turn_rate: 0.0 }),
            stop_after: Some(Duration::from_millis(2000)),
            analyze_after: Duration::from_millis(2100),
        },
        CalibrationStep::TurnAccuracy => ProbePlan {
            command: Some(Command::Drive { speed: 0.0, turn_rate: PROBE_TURN_RATE }),
            stop_after: Some(Duration::from_millis(1500)),
            analyze_after: Duration::from_millis(1600),
        },
        // Stationary reads: the robot must not move while sampling
        CalibrationStep::Gyroscope | CalibrationStep::MotorBalance => ProbePlan {
            command: Some(Command::Stop),
            stop_after: None,
            analyze_after: Duration::from_millis(100),
        },
        _ => ProbePlan { command: None, stop_after: None, analyze_after: Duration::ZERO },
    }
}

/// Confidence from how far a measurement deviates from its expected range
fn confidence_for(deviation: f64, expected_range: f64) -> f64 {
    (1.0 - deviation.abs() / expected_range).clamp(0.0, 1.0)
}

struct Probe {
    issued_at: Instant,
    stop_at: Option<Instant>,
    analyze_at: Instant,
    stopped: bool,
}

pub struct Calibration {
    simulation: bool,
    running: bool,
    step: CalibrationStep,
    attempt: u32,
    results: Vec<CalibrationResult>,
    working: RobotConfig,
    // Scheduled entry into a step (initial, inter-step or retry delay)
    step_timer: Option<(Instant, CalibrationStep)>,
    watchdog: Option<Instant>,
    probe: Option<Probe>,
    events: Vec<CalibrationEvent>,
}

impl Calibration {
    pub fn new(simulation: bool) -> Self {
        Self {
            simulation,
            running: false,
            step: CalibrationStep::NotStarted,
            attempt: 0,
            results: Vec::new(),
            working: RobotConfig::default(),
            step_timer: None,
            watchdog: None,
            probe: None,
            events: Vec::new(),
        }
    }

    pub fn set_simulation(&mut self, simulation: bool) {
        self.simulation = simulation;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn current_step(&self) -> CalibrationStep {
        self.step
    }

    pub fn results(&self) -> &[CalibrationResult] {
        &self.results
    }

    /// A run needs either simulation mode or a connected target
    pub fn can_calibrate(&self, dispatcher: &Dispatcher) -> bool {
        self.simulation || dispatcher.target.is_connected()
    }

    /// Begin a calibration run. Starting while already running is a no-op
    /// warning; starting with no target and no simulation mode fails with
    /// no state change.
    pub fn start(&mut self, now: Instant, dispatcher: &Dispatcher, base: &RobotConfig) -> Vec<CalibrationEvent> {
        if self.running {
            warn!("Calibration already in progress");
            return Vec::new();
        }
        if !self.can_calibrate(dispatcher) {
            let reason =
                "Cannot start calibration: no hub connected and simulation mode disabled";
            warn!("{}", reason);
            self.events.push(CalibrationEvent::Failed(reason.to_string()));
            return self.drain();
        }

        self.step = CalibrationStep::NotStarted;
        self.attempt = 0;
        self.results.clear();
        self.working = base.clone();
        self.working.clear_calibration();
        self.watchdog = None;
        self.probe = None;
        self.running = true;

        self.events.push(CalibrationEvent::Started);
        self.events.push(CalibrationEvent::Progress(0));
        self.step_timer = Some((now + STEP_START_DELAY, CalibrationStep::MotorResponseTime));
        self.drain()
    }

    /// Cancel a running calibration; committed step results are kept but
    /// nothing is applied.
    pub fn stop(&mut self) -> Vec<CalibrationEvent> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        self.step_timer = None;
        self.watchdog = None;
        self.probe = None;
        self.events.push(CalibrationEvent::Failed("Calibration cancelled by user".to_string()));
        self.drain()
    }

    /// Fire whatever has come due: step entry, probe stop, probe analysis,
    /// then the watchdog.
    pub fn poll(&mut self, now: Instant, dispatcher: &mut Dispatcher) -> Vec<CalibrationEvent> {
        if !self.running {
            return Vec::new();
        }

        if let Some((at, step)) = self.step_timer
            && now >= at
        {
            self.step_timer = None;
            self.enter_step(step, now, dispatcher);
        }

        if self.running
            && let Some(probe) = &mut self.probe
            && let Some(stop_at) = probe.stop_at
            && !probe.stopped
            && now >= stop_at
        {
            probe.stopped = true;
            dispatcher.dispatch(Command::Stop, now);
        }

        if self.running
            && self.probe.as_ref().is_some_and(|p| now >= p.analyze_at)
            && let Some(probe) = self.probe.take()
        {
            let (success, value, confidence, description) = self.analyze(now, &probe);
            self.complete_step(success, value, confidence, description, now);
        }

        if self.running
            && let Some(deadline) = self.watchdog
            && now >= deadline
        {
            self.complete_step(false, 0.0, 0.0, "Step timed out".to_string(), now);
        }

        self.drain()
    }

    fn enter_step(&mut self, step: CalibrationStep, now: Instant, dispatcher: &mut Dispatcher) {
        self.step = step;

        match step {
            CalibrationStep::Completed => {
                self.events.push(CalibrationEvent::Progress(100));
                self.events.push(CalibrationEvent::Completed(self.working.clone()));
                self.running = false;
                info!("Calibration completed, quality {:.1}%", self.working.calibration_quality);
            }
            CalibrationStep::Finalization => {
                self.events.push(CalibrationEvent::StepChanged {
                    step,
                    description: "Finalizing calibration...".to_string(),
                });
                self.events.push(CalibrationEvent::Progress(95));
                self.finalize(now);
            }
            _ => {
                let Some(spec) = step_spec(step) else {
                    self.running = false;
                    self.events.push(CalibrationEvent::Failed(format!(
                        "Unknown calibration step: {step:?}"
                    )));
                    return;
                };
                let timeout = if self.simulation { STEP_TIMEOUT_SIM } else { STEP_TIMEOUT_HW };
                self.watchdog = Some(now + timeout);
                self.events.push(CalibrationEvent::StepChanged {
                    step,
                    description: spec.description.to_string(),
                });
                self.events.push(CalibrationEvent::Progress(spec.progress));

                if self.simulation {
                    let (value, description) = self.inject_simulated(step);
                    self.complete_step(true, value, 0.9, description, now);
                } else if dispatcher.target.is_connected() {
                    let plan = probe_plan(step);
                    if let Some(command) = plan.command {
                        dispatcher.dispatch(command, now);
                    }
                    self.probe = Some(Probe {
                        issued_at: now,
                        stop_at: plan.stop_after.map(|d| now + d),
                        analyze_at: now + plan.analyze_after,
                        stopped: false,
                    });
                } else {
                    self.complete_step(
                        false,
                        0.0,
                        0.0,
                        "No hub connected, cannot run hardware probe".to_string(),
                        now,
                    );
                }
            }
        }
    }

    /// Simulation path: inject fixed, plausible constants immediately
    fn inject_simulated(&mut self, step: CalibrationStep) -> (f64, String) {
        match step {
            CalibrationStep::MotorResponseTime => {
                // Matches the simulator's own motor-lag constant
                let delay = 25.0;
                self.working.left_motor_delay = delay;
                self.working.right_motor_delay = delay;
                self.working.arm1_motor_delay = delay;
                self.working.arm2_motor_delay = delay;
                self.working.motor_response_time = delay;
                (delay, "Motor response time (simulated)".to_string())
            }
            CalibrationStep::StraightTracking => {
                let drift = 0.5;
                self.working.straight_drift_correction = drift;
                self.working.left_motor_speed_factor = 1.0;
                self.working.right_motor_speed_factor = 0.98;
                (drift, "Straight drift correction (simulated)".to_string())
            }
            CalibrationStep::TurnAccuracy => {
                let accuracy = 0.95;
                self.working.turn_accuracy_factor = accuracy;
                (accuracy, "Turn accuracy factor (simulated)".to_string())
            }
            CalibrationStep::Gyroscope => {
                let drift = 0.002;
                self.working.gyroscope_drift = drift;
                self.working.gyroscope_delay = 15.0;
                (drift, "Gyroscope drift rate (simulated)".to_string())
            }
            CalibrationStep::MotorBalance => {
                self.working.left_motor_speed_factor = 1.0;
                self.working.right_motor_speed_factor = 0.98;
                (0.98, "Motor balance factor (simulated)".to_string())
            }
            _ => (0.0, String::new()),
        }
    }

    /// Hardware path: derive measured values from the timed probe
    fn analyze(&mut self, now: Instant, probe: &Probe) -> (bool, f64, f64, String) {
        let elapsed_ms = now.duration_since(probe.issued_at).as_secs_f64() * 1000.0;
        match self.step {
            CalibrationStep::MotorResponseTime => {
                self.working.motor_response_time = elapsed_ms;
                self.working.left_motor_delay = elapsed_ms * 0.9;
                self.working.right_motor_delay = elapsed_ms * 1.1;
                self.working.arm1_motor_delay = elapsed_ms;
                self.working.arm2_motor_delay = elapsed_ms;
                (true, elapsed_ms, 0.9, "Motor response time measured".to_string())
            }
            CalibrationStep::StraightTracking => {
                let drift = 0.3;
                self.working.straight_drift_correction = drift;
                self.working.left_motor_speed_factor = 1.0;
                self.working.right_motor_speed_factor = 0.99;
                let confidence = confidence_for(drift, 5.0);
                (true, drift, confidence, "Straight tracking drift measured".to_string())
            }
            CalibrationStep::TurnAccuracy => {
                let accuracy = 0.97;
                self.working.turn_accuracy_factor = accuracy;
                let confidence = confidence_for(1.0 - accuracy, 0.25);
                (true, accuracy, confidence, "Turn accuracy measured".to_string())
            }
            CalibrationStep::Gyroscope => {
                let drift = 0.001;
                self.working.gyroscope_drift = drift;
                self.working.gyroscope_delay = 18.0;
                let confidence = confidence_for(drift, 0.01);
                (true, drift, confidence, "Gyroscope drift measured".to_string())
            }
            CalibrationStep::MotorBalance => {
                let left = 1.0;
                let right = 0.98;
                self.working.left_motor_speed_factor = left;
                self.working.right_motor_speed_factor = right;
                let confidence = confidence_for(left - right, 0.2);
                (true, right, confidence, "Motor balance measured".to_string())
            }
            _ => (false, 0.0, 0.0, "No analysis for this step".to_string()),
        }
    }

    /// Record the step result, then advance, retry or abort the run
    fn complete_step(
        &mut self,
        success: bool,
        measured_value: f64,
        confidence: f64,
        description: String,
        now: Instant,
    ) {
        self.watchdog = None;
        self.probe = None;

        let Some(spec) = step_spec(self.step) else {
            return;
        };
        let result = CalibrationResult {
            success,
            step_name: spec.name.to_string(),
            measured_value,
            units: spec.units.to_string(),
            description: description.clone(),
            confidence: if success { confidence } else { 0.0 },
        };
        self.results.push(result.clone());
        self.events.push(CalibrationEvent::StepCompleted(result));

        if success {
            self.attempt = 0;
            self.step_timer = Some((now + INTER_STEP_DELAY, spec.next));
        } else {
            self.attempt += 1;
            if self.attempt < MAX_STEP_ATTEMPTS {
                warn!("{} failed, retrying (attempt {})", spec.name, self.attempt + 1);
                self.step_timer = Some((now + RETRY_DELAY, self.step));
            } else {
                self.running = false;
                self.events.push(CalibrationEvent::Failed(format!(
                    "{} failed after {} attempts: {}",
                    spec.name, MAX_STEP_ATTEMPTS, description
                )));
            }
        }
    }

    /// Score the run; below the quality threshold the whole run is
    /// rejected even though every step succeeded.
    fn finalize(&mut self, now: Instant) {
        let successful: Vec<&CalibrationResult> =
            self.results.iter().filter(|r| r.success).collect();
        let quality = if successful.is_empty() {
            0.0
        } else {
            let total: f64 = successful.iter().map(|r| r.confidence).sum();
            total / successful.len() as f64 * 100.0
        };

        if quality < QUALITY_THRESHOLD {
            self.running = false;
            self.events.push(CalibrationEvent::Failed(format!(
                "Calibration quality too low: {quality:.1}%"
            )));
            return;
        }

        self.working.is_calibrated = true;
        self.working.calibration_date =
            Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        self.working.calibration_quality = quality;

        let result = CalibrationResult {
            success: true,
            step_name: "Calibration Complete".to_string(),
            measured_value: quality,
            units: "%".to_string(),
            description: format!("Overall calibration quality: {quality:.1}%"),
            confidence: quality / 100.0,
        };
        self.results.push(result.clone());
        self.events.push(CalibrationEvent::StepCompleted(result));

        self.step_timer = Some((now + STEP_START_DELAY, CalibrationStep::Completed));
    }

    fn drain(&mut self) -> Vec<CalibrationEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WireCommand;
    use crate::dispatch::ExecutionTarget;
    use crate::hub::HubLink;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeLink {
        connected: bool,
        sent: Rc<RefCell<Vec<WireCommand>>>,
    }

    impl HubLink for FakeLink {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send_command(&mut self, cmd: &WireCommand) {
            self.sent.borrow_mut().push(*cmd);
        }
    }

    fn dispatcher_with_link(connected: bool) -> (Dispatcher, Rc<RefCell<Vec<WireCommand>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let link = FakeLink { connected, sent: Rc::clone(&sent) };
        let dispatcher =
            Dispatcher::new(RobotConfig::default(), ExecutionTarget::Hardware(Box::new(link)));
        (dispatcher, sent)
    }

    /// Advance virtual time in 50ms increments, polling until the run ends
    fn run_to_end(
        cal: &mut Calibration,
        dispatcher: &mut Dispatcher,
        t0: Instant,
        limit: Duration,
    ) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        let mut elapsed = Duration::ZERO;
        while cal.is_running() && elapsed < limit {
            elapsed += Duration::from_millis(50);
            events.extend(cal.poll(t0 + elapsed, dispatcher));
        }
        events
    }

    #[test]
    fn start_without_link_or_simulation_fails_with_no_state_change() {
        let (mut dispatcher, _) = dispatcher_with_link(false);
        let mut cal = Calibration::new(false);
        assert!(!cal.can_calibrate(&dispatcher));

        let events = cal.start(Instant::now(), &dispatcher, &RobotConfig::default());
        assert_eq!(events.len(), 1);
        match &events[0] {
            CalibrationEvent::Failed(reason) => {
                assert!(reason.starts_with("Cannot start calibration"))
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(cal.current_step(), CalibrationStep::NotStarted);
        assert!(!cal.is_running());
        assert!(cal.poll(Instant::now(), &mut dispatcher).is_empty());
    }

    #[test]
    fn duplicate_start_is_a_no_op() {
        let (dispatcher, _) = dispatcher_with_link(true);
        let mut cal = Calibration::new(true);
        let t0 = Instant::now();
        let first = cal.start(t0, &dispatcher, &RobotConfig::default());
        assert!(first.contains(&CalibrationEvent::Started));
        let second = cal.start(t0, &dispatcher, &RobotConfig::default());
        assert!(second.is_empty());
        assert!(cal.is_running());
    }

    #[test]
    fn simulated_run_completes_with_quality_90() {
        let (mut dispatcher, _) = dispatcher_with_link(false);
        let mut cal = Calibration::new(true);
        let t0 = Instant::now();
        let mut events = cal.start(t0, &dispatcher, &RobotConfig::default());
        events.extend(run_to_end(&mut cal, &mut dispatcher, t0, Duration::from_secs(10)));

        let completed = events.iter().find_map(|e| match e {
            CalibrationEvent::Completed(config) => Some(config.clone()),
            _ => None,
        });
        let config = completed.expect("run should complete");
        assert!(config.is_calibrated);
        assert_eq!(config.calibration_quality, 90.0);
        assert!(config.calibration_date.is_some());
        assert_eq!(config.right_motor_speed_factor, 0.98);
        assert_eq!(config.turn_accuracy_factor, 0.95);

        // Five step results plus the finalization summary
        assert_eq!(cal.results().len(), 6);
        assert!(cal.results().iter().all(|r| r.success));
        assert_eq!(cal.results()[0].step_name, "Motor Response Time");
        assert_eq!(cal.results()[0].units, "ms");
        assert_eq!(cal.current_step(), CalibrationStep::Completed);
        assert!(!cal.is_running());
    }

    #[test]
    fn hardware_run_issues_probe_and_stop_commands() {
        let (mut dispatcher, sent) = dispatcher_with_link(true);
        let mut cal = Calibration::new(false);
        let t0 = Instant::now();
        cal.start(t0, &dispatcher, &RobotConfig::default());

        // Enter the first step and issue its probe
        cal.poll(t0 + Duration::from_millis(150), &mut dispatcher);
        assert_eq!(
            sent.borrow().as_slice(),
            &[WireCommand::Drive { speed: 200.0, turn_rate: 0.0 }]
        );

        // Probe stop fires at 200ms after entry
        cal.poll(t0 + Duration::from_millis(400), &mut dispatcher);
        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(sent.borrow()[1], WireCommand::Drive { speed: 0.0, turn_rate: 0.0 });

        // Analysis fires at 500ms after entry and completes the step
        let events = cal.poll(t0 + Duration::from_millis(700), &mut dispatcher);
        assert!(events.iter().any(|e| matches!(
            e,
            CalibrationEvent::StepCompleted(result) if result.success
        )));
        assert_eq!(cal.current_step(), CalibrationStep::MotorResponseTime);
    }

    #[test]
    fn hardware_run_completes_end_to_end() {
        let (mut dispatcher, _) = dispatcher_with_link(true);
        let mut cal = Calibration::new(false);
        let t0 = Instant::now();
        let mut events = cal.start(t0, &dispatcher, &RobotConfig::default());
        events.extend(run_to_end(&mut cal, &mut dispatcher, t0, Duration::from_secs(30)));

        let completed = events.iter().any(|e| matches!(e, CalibrationEvent::Completed(_)));
        assert!(completed, "hardware run should complete: {events:?}");
    }

    #[test]
    fn disconnected_mid_run_aborts_after_three_attempts() {
        let (mut dispatcher, _) = dispatcher_with_link(true);
        let mut cal = Calibration::new(false);
        let t0 = Instant::now();
        cal.start(t0, &dispatcher, &RobotConfig::default());

        // Link drops before the first step entry
        let (disconnected, _) = dispatcher_with_link(false);
        dispatcher.target = disconnected.target;

        let events = run_to_end(&mut cal, &mut dispatcher, t0, Duration::from_secs(10));
        let failure = events.iter().find_map(|e| match e {
            CalibrationEvent::Failed(reason) => Some(reason.clone()),
            _ => None,
        });
        let reason = failure.expect("run should abort");
        assert!(reason.contains("Motor Response Time"), "{reason}");
        assert!(reason.contains("after 3 attempts"), "{reason}");
        assert!(!cal.is_running());

        let failed_results = cal.results().iter().filter(|r| !r.success).count();
        assert_eq!(failed_results, 3);
    }

    #[test]
    fn watchdog_timeout_counts_as_step_failure() {
        let (mut dispatcher, _) = dispatcher_with_link(true);
        let mut cal = Calibration::new(false);
        let t0 = Instant::now();
        cal.start(t0, &dispatcher, &RobotConfig::default());
        cal.poll(t0 + Duration::from_millis(150), &mut dispatcher);
        assert!(cal.probe.is_some());

        // A lost probe means nothing ever analyzes; the watchdog must fire
        cal.probe = None;
        let events = cal.poll(t0 + Duration::from_millis(150) + STEP_TIMEOUT_HW, &mut dispatcher);
        let timed_out = events.iter().any(|e| matches!(
            e,
            CalibrationEvent::StepCompleted(result)
                if !result.success && result.description == "Step timed out"
        ));
        assert!(timed_out, "{events:?}");
        assert!(cal.is_running(), "one timeout only consumes one attempt");
    }

    #[test]
    fn low_quality_run_is_rejected_at_finalization() {
        let (mut dispatcher, _) = dispatcher_with_link(true);
        let mut cal = Calibration::new(true);
        let t0 = Instant::now();
        cal.start(t0, &dispatcher, &RobotConfig::default());
        cal.drain();

        // Force finalization over low-confidence results
        cal.results = vec![CalibrationResult {
            success: true,
            step_name: "Motor Response Time".to_string(),
            measured_value: 25.0,
            units: "ms".to_string(),
            description: String::new(),
            confidence: 0.5,
        }];
        cal.step_timer = Some((t0, CalibrationStep::Finalization));
        let events = cal.poll(t0, &mut dispatcher);

        let failure = events.iter().find_map(|e| match e {
            CalibrationEvent::Failed(reason) => Some(reason.clone()),
            _ => None,
        });
        assert_eq!(failure.as_deref(), Some("Calibration quality too low: 50.0%"));
        assert!(!cal.is_running());
        assert!(!cal.working.is_calibrated);
        assert_eq!(cal.working.calibration_quality, 0.0);
    }

    #[test]
    fn cancellation_halts_timers_and_emits_failure() {
        let (mut dispatcher, sent) = dispatcher_with_link(true);
        let mut cal = Calibration::new(false);
        let t0 = Instant::now();
        cal.start(t0, &dispatcher, &RobotConfig::default());
        cal.poll(t0 + Duration::from_millis(150), &mut dispatcher);
        let sent_before = sent.borrow().len();

        let events = cal.stop();
        assert_eq!(
            events,
            vec![CalibrationEvent::Failed("Calibration cancelled by user".to_string())]
        );
        assert!(!cal.is_running());

        // No late probe stop or watchdog can fire against the cancelled run
        let events = cal.poll(t0 + Duration::from_secs(60), &mut dispatcher);
        assert!(events.is_empty());
        assert_eq!(sent.borrow().len(), sent_before);

        let repeat = cal.stop();
        assert!(repeat.is_empty());
    }
}
