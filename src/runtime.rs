// Operator console loop
//
// A 50 Hz tick drives everything: drain key events, decay stale input,
// dispatch changed commands, advance the simulator and poll the
// calibration and playback state machines. Terminals deliver no key-up,
// so a movement key counts as held only while recent presses keep
// refreshing it.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::calibration::{Calibration, CalibrationEvent};
use crate::command::{ArmId, Command};
use crate::config::{
    DEFAULT_RUNS_DIR, INPUT_DECAY, KEY_ARM_SPEED, KEY_DRIVE_SPEED, KEY_TURN_RATE, LOOP_HZ,
    WORKSPACE_HEIGHT, WORKSPACE_WIDTH,
};
use crate::dispatch::{Dispatcher, ExecutionTarget};
use crate::error::{ConsoleError, Result};
use crate::hub::SerialHubLink;
use crate::recording::{Playback, SavedRun};
use crate::robot_config::RobotConfig;
use crate::sim::PhysicsEngine;

/// Last-press times for the held movement keys. An axis reads as held
/// while its most recent press is younger than the decay window.
#[derive(Default)]
struct InputState {
    forward: Option<Instant>,
    backward: Option<Instant>,
    left: Option<Instant>,
    right: Option<Instant>,
    arm1_up: Option<Instant>,
    arm1_down: Option<Instant>,
    arm2_up: Option<Instant>,
    arm2_down: Option<Instant>,
}

impl InputState {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn held(slot: Option<Instant>, now: Instant) -> f64 {
        match slot {
            Some(at) if now.duration_since(at) < INPUT_DECAY => 1.0,
            _ => 0.0,
        }
    }

    fn drive_command(&self, now: Instant) -> Command {
        let speed =
            (Self::held(self.forward, now) - Self::held(self.backward, now)) * KEY_DRIVE_SPEED;
        let turn_rate =
            (Self::held(self.right, now) - Self::held(self.left, now)) * KEY_TURN_RATE;
        Command::Drive { speed, turn_rate }
    }

    fn arm_command(&self, arm: ArmId, now: Instant) -> Command {
        let (up, down) = match arm {
            ArmId::Arm1 => (self.arm1_up, self.arm1_down),
            ArmId::Arm2 => (self.arm2_up, self.arm2_down),
        };
        let speed = (Self::held(up, now) - Self::held(down, now)) * KEY_ARM_SPEED;
        Command::Arm { arm, speed }
    }
}

pub struct Console {
    dispatcher: Dispatcher,
    calibration: Calibration,
    playback: Playback,
    runs_dir: PathBuf,
    input: InputState,
    last_drive: Option<Command>,
    last_arm1: Option<Command>,
    last_arm2: Option<Command>,
    tick_count: u64,
    quit: bool,
}

impl Console {
    pub fn new(target: ExecutionTarget, runs_dir: PathBuf) -> Self {
        let simulation = matches!(target, ExecutionTarget::Simulated(_));
        Self {
            dispatcher: Dispatcher::new(RobotConfig::default(), target),
            calibration: Calibration::new(simulation),
            playback: Playback::new(),
            runs_dir,
            input: InputState::default(),
            last_drive: None,
            last_arm1: None,
            last_arm2: None,
            tick_count: 0,
            quit: false,
        }
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Key map:
    ///   W/S/A/D drive, Q/E arm 1, R/F arm 2, Space emergency stop
    ///   G/H start/stop recording, Z/Y undo/redo, O save run, P play latest
    ///   C calibrate, X cancel calibration or playback, B reset simulator
    ///   Esc quit
    fn handle_key(&mut self, code: KeyCode, now: Instant) {
        match code {
            KeyCode::Char('w') => self.input.forward = Some(now),
            KeyCode::Char('s') => self.input.backward = Some(now),
            KeyCode::Char('a') => self.input.left = Some(now),
            KeyCode::Char('d') => self.input.right = Some(now),
            KeyCode::Char('q') => self.input.arm1_up = Some(now),
            KeyCode::Char('e') => self.input.arm1_down = Some(now),
            KeyCode::Char('r') => self.input.arm2_up = Some(now),
            KeyCode::Char('f') => self.input.arm2_down = Some(now),
            KeyCode::Char(' ') => self.emergency_stop(now),
            KeyCode::Char('g') => {
                info!("Recording started");
                self.dispatcher.recorder.start(now);
            }
            KeyCode::Char('h') => {
                info!("Recording stopped ({} commands)", self.dispatcher.recorder.commands().len());
                self.dispatcher.recorder.stop();
            }
            KeyCode::Char('z') => {
                if !self.dispatcher.recorder.undo() {
                    debug!("Nothing to undo");
                }
            }
            KeyCode::Char('y') => {
                if !self.dispatcher.recorder.redo() {
                    debug!("Nothing to redo");
                }
            }
            KeyCode::Char('o') => {
                if let Err(e) = self.save_recording() {
                    warn!("Save failed: {}", e);
                }
            }
            KeyCode::Char('p') => {
                if let Err(e) = self.play_latest(now) {
                    warn!("Playback failed: {}", e);
                }
            }
            KeyCode::Char('c') => {
                let base = self.dispatcher.config.clone();
                let events = self.calibration.start(now, &self.dispatcher, &base);
                self.handle_calibration_events(events);
            }
            KeyCode::Char('x') => {
                if self.calibration.is_running() {
                    let events = self.calibration.stop();
                    self.handle_calibration_events(events);
                } else if self.playback.is_playing() {
                    self.playback.stop();
                    self.emergency_stop(now);
                    info!("Playback stopped");
                }
            }
            KeyCode::Char('b') => {
                self.dispatcher.target.reset();
                info!("Simulator reset");
            }
            KeyCode::Esc => self.quit = true,
            _ => {}
        }
    }

    /// Drop all held input and command zero velocity everywhere
    fn emergency_stop(&mut self, now: Instant) {
        self.input.clear();
        self.dispatcher.dispatch(Command::Stop, now);
        self.dispatcher.dispatch(Command::Arm { arm: ArmId::Arm1, speed: 0.0 }, now);
        self.dispatcher.dispatch(Command::Arm { arm: ArmId::Arm2, speed: 0.0 }, now);
        self.last_drive = Some(Command::Drive { speed: 0.0, turn_rate: 0.0 });
        self.last_arm1 = Some(Command::Arm { arm: ArmId::Arm1, speed: 0.0 });
        self.last_arm2 = Some(Command::Arm { arm: ArmId::Arm2, speed: 0.0 });
    }

    /// One pass of the control loop at `now`
    fn tick(&mut self, now: Instant) {
        self.playback.poll(now, &mut self.dispatcher);

        let events = self.calibration.poll(now, &mut self.dispatcher);
        self.handle_calibration_events(events);

        // Teleop yields while a replay or a calibration probe owns the robot
        if !self.playback.is_playing() && !self.calibration.is_running() {
            self.dispatch_teleop(now);
        }

        self.dispatcher.target.tick();

        self.tick_count += 1;
        if self.tick_count % LOOP_HZ == 0
            && let Some(state) = self.dispatcher.target.state()
        {
            debug!(
                x = format_args!("{:.1}", state.x),
                y = format_args!("{:.1}", state.y),
                heading = format_args!("{:.1}", state.heading),
                "sim state"
            );
        }
    }

    /// Dispatch teleop commands, but only when they change
    fn dispatch_teleop(&mut self, now: Instant) {
        let drive = self.input.drive_command(now);
        if self.last_drive != Some(drive) {
            self.dispatcher.dispatch(drive, now);
            self.last_drive = Some(drive);
        }
        for (arm, last) in [(ArmId::Arm1, &mut self.last_arm1), (ArmId::Arm2, &mut self.last_arm2)]
        {
            let cmd = self.input.arm_command(arm, now);
            if *last != Some(cmd) {
                self.dispatcher.dispatch(cmd, now);
                *last = Some(cmd);
            }
        }
    }

    fn handle_calibration_events(&mut self, events: Vec<CalibrationEvent>) {
        for event in events {
            match event {
                CalibrationEvent::Started => info!("Calibration started"),
                CalibrationEvent::StepChanged { description, .. } => info!("{}", description),
                CalibrationEvent::Progress(pct) => debug!("Calibration progress: {}%", pct),
                CalibrationEvent::StepCompleted(result) => {
                    if result.success {
                        info!(
                            "{}: {:.2} {} (confidence {:.0}%)",
                            result.step_name,
                            result.measured_value,
                            result.units,
                            result.confidence * 100.0
                        );
                    } else {
                        warn!("{} failed: {}", result.step_name, result.description);
                    }
                }
                CalibrationEvent::Completed(config) => {
                    info!(
                        "Calibration accepted, quality {:.1}%",
                        config.calibration_quality
                    );
                    self.dispatcher.config = config;
                }
                CalibrationEvent::Failed(reason) => warn!("{}", reason),
            }
        }
    }

    fn save_recording(&mut self) -> Result<PathBuf> {
        let commands = self.dispatcher.recorder.take()?;
        let run = SavedRun::new("recorded_run", self.dispatcher.config.clone(), commands);
        run.save(&self.runs_dir)
    }

    fn play_latest(&mut self, now: Instant) -> Result<()> {
        let runs = SavedRun::list(&self.runs_dir)?;
        let Some(latest) = runs.first() else {
            return Err(ConsoleError::NoSavedRuns(self.runs_dir.clone()));
        };
        let run = SavedRun::load(latest)?;
        info!("Loaded run: {} ({} commands)", run.name, run.commands.len());
        self.playback.load(run);
        self.playback.start(now)
    }
}

/// Restores the terminal even on early return or panic
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

pub async fn run(simulate: bool, port: &str, runs_dir: Option<PathBuf>) -> Result<()> {
    let target = if simulate {
        info!("Running against the simulator");
        ExecutionTarget::Simulated(PhysicsEngine::new(WORKSPACE_WIDTH, WORKSPACE_HEIGHT))
    } else {
        let link = match SerialHubLink::open(port) {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not open {}: {}. Starting disconnected.", port, e);
                SerialHubLink::disconnected()
            }
        };
        ExecutionTarget::Hardware(Box::new(link))
    };

    let runs_dir = runs_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_RUNS_DIR));
    let mut console = Console::new(target, runs_dir);

    let _raw = RawModeGuard::enable()?;
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    info!("Console started: {}Hz loop, Esc to quit", LOOP_HZ);

    while !console.should_quit() {
        tick.tick().await;
        let now = Instant::now();

        // Drain pending key events without blocking the loop
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Release {
                    continue;
                }
                if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL)
                {
                    console.quit = true;
                    continue;
                }
                console.handle_key(key.code, now);
            }
        }

        console.tick(now);
    }

    info!("Console shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WireCommand;
    use crate::hub::HubLink;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CaptureLink {
        sent: Rc<RefCell<Vec<WireCommand>>>,
    }

    impl HubLink for CaptureLink {
        fn is_connected(&self) -> bool {
            true
        }

        fn send_command(&mut self, cmd: &WireCommand) {
            self.sent.borrow_mut().push(*cmd);
        }
    }

    fn capture_console() -> (Console, Rc<RefCell<Vec<WireCommand>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let link = CaptureLink { sent: Rc::clone(&sent) };
        let console = Console::new(
            ExecutionTarget::Hardware(Box::new(link)),
            PathBuf::from("saved_runs"),
        );
        (console, sent)
    }

    #[test]
    fn held_key_drives_until_decay() {
        let (mut console, sent) = capture_console();
        let t0 = Instant::now();

        console.handle_key(KeyCode::Char('w'), t0);
        console.tick(t0);
        // First tick latches the drive command plus the zero arm baselines
        assert_eq!(
            sent.borrow().first(),
            Some(&WireCommand::Drive { speed: KEY_DRIVE_SPEED, turn_rate: 0.0 })
        );

        // Unchanged input sends nothing new
        let count = sent.borrow().len();
        console.tick(t0 + Duration::from_millis(20));
        assert_eq!(sent.borrow().len(), count);

        // Past the decay window the drive command falls back to zero
        console.tick(t0 + INPUT_DECAY + Duration::from_millis(10));
        assert_eq!(
            sent.borrow().last(),
            Some(&WireCommand::Drive { speed: 0.0, turn_rate: 0.0 })
        );
    }

    #[test]
    fn opposite_keys_cancel_out() {
        let input = InputState {
            forward: Some(Instant::now()),
            backward: Some(Instant::now()),
            ..Default::default()
        };
        let cmd = input.drive_command(Instant::now());
        assert_eq!(cmd, Command::Drive { speed: 0.0, turn_rate: 0.0 });
    }

    #[test]
    fn turn_keys_map_to_signed_turn_rate() {
        let now = Instant::now();
        let input = InputState { left: Some(now), ..Default::default() };
        assert_eq!(
            input.drive_command(now),
            Command::Drive { speed: 0.0, turn_rate: -KEY_TURN_RATE }
        );
        let input = InputState { right: Some(now), ..Default::default() };
        assert_eq!(
            input.drive_command(now),
            Command::Drive { speed: 0.0, turn_rate: KEY_TURN_RATE }
        );
    }

    #[test]
    fn arm_keys_map_to_arm_commands() {
        let now = Instant::now();
        let input = InputState { arm1_up: Some(now), arm2_down: Some(now), ..Default::default() };
        assert_eq!(
            input.arm_command(ArmId::Arm1, now),
            Command::Arm { arm: ArmId::Arm1, speed: KEY_ARM_SPEED }
        );
        assert_eq!(
            input.arm_command(ArmId::Arm2, now),
            Command::Arm { arm: ArmId::Arm2, speed: -KEY_ARM_SPEED }
        );
    }

    #[test]
    fn space_stops_everything_immediately() {
        let (mut console, sent) = capture_console();
        let t0 = Instant::now();
        console.handle_key(KeyCode::Char('w'), t0);
        console.tick(t0);
        sent.borrow_mut().clear();

        console.handle_key(KeyCode::Char(' '), t0 + Duration::from_millis(20));
        assert_eq!(
            sent.borrow().as_slice(),
            &[
                WireCommand::Drive { speed: 0.0, turn_rate: 0.0 },
                WireCommand::Arm1 { speed: 0.0 },
                WireCommand::Arm2 { speed: 0.0 },
            ]
        );

        // The stop state is already latched, the next tick resends nothing
        console.tick(t0 + Duration::from_millis(40));
        assert_eq!(sent.borrow().len(), 3);
    }

    #[test]
    fn recording_keys_capture_teleop_commands() {
        let (mut console, _) = capture_console();
        let t0 = Instant::now();

        console.handle_key(KeyCode::Char('g'), t0);
        console.handle_key(KeyCode::Char('w'), t0);
        console.tick(t0);
        console.handle_key(KeyCode::Char('h'), t0 + Duration::from_millis(100));

        // The drive command plus the two zero arm baselines
        let recorded = console.dispatcher.recorder.commands();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].command_type, "drive");
        assert_eq!(recorded[0].parameters["speed"], KEY_DRIVE_SPEED);
        assert_eq!(recorded[1].command_type, "arm1");
        assert_eq!(recorded[2].command_type, "arm2");
    }

    #[test]
    fn save_then_play_replays_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (mut console, sent) = capture_console();
        console.runs_dir = dir.path().to_path_buf();
        let t0 = Instant::now();

        console.handle_key(KeyCode::Char('g'), t0);
        console.handle_key(KeyCode::Char('w'), t0);
        console.tick(t0);
        console.handle_key(KeyCode::Char('h'), t0 + Duration::from_millis(50));
        console.save_recording().unwrap();

        // Let the held key decay so teleop settles back to zero
        console.tick(t0 + Duration::from_millis(300));
        sent.borrow_mut().clear();

        let t1 = t0 + Duration::from_secs(5);
        console.play_latest(t1).unwrap();
        assert!(console.playback.is_playing());

        // All three recorded commands were stamped at t=0 and fire at once
        console.tick(t1);
        assert_eq!(
            sent.borrow().as_slice(),
            &[
                WireCommand::Drive { speed: KEY_DRIVE_SPEED, turn_rate: 0.0 },
                WireCommand::Arm1 { speed: 0.0 },
                WireCommand::Arm2 { speed: 0.0 },
            ]
        );
        assert!(!console.playback.is_playing());
    }

    #[test]
    fn play_latest_with_no_runs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut console, _) = capture_console();
        console.runs_dir = dir.path().to_path_buf();
        let err = console.play_latest(Instant::now());
        assert!(matches!(err, Err(ConsoleError::NoSavedRuns(_))));
    }

    #[test]
    fn completed_calibration_is_committed_to_the_dispatcher() {
        let sim = ExecutionTarget::Simulated(PhysicsEngine::new(800.0, 600.0));
        let mut console = Console::new(sim, PathBuf::from("saved_runs"));
        let t0 = Instant::now();

        console.handle_key(KeyCode::Char('c'), t0);
        assert!(console.calibration.is_running());

        let mut elapsed = Duration::ZERO;
        while console.calibration.is_running() && elapsed < Duration::from_secs(10) {
            elapsed += Duration::from_millis(20);
            console.tick(t0 + elapsed);
        }

        assert!(console.dispatcher.config.is_calibrated);
        assert_eq!(console.dispatcher.config.calibration_quality, 90.0);
    }

    #[test]
    fn x_cancels_a_running_calibration() {
        let sim = ExecutionTarget::Simulated(PhysicsEngine::new(800.0, 600.0));
        let mut console = Console::new(sim, PathBuf::from("saved_runs"));
        let t0 = Instant::now();

        console.handle_key(KeyCode::Char('c'), t0);
        console.handle_key(KeyCode::Char('x'), t0 + Duration::from_millis(10));
        assert!(!console.calibration.is_running());
        assert!(!console.dispatcher.config.is_calibrated);
    }
}
