// Loop rates, timeouts, key speeds, calibration thresholds
use std::time::Duration;

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// Movement keys decay to zero after this much time with no input
pub const INPUT_DECAY: Duration = Duration::from_millis(200);

// Command magnitudes for keyboard driving (device units)
pub const KEY_DRIVE_SPEED: f64 = 200.0;
pub const KEY_TURN_RATE: f64 = 100.0;
pub const KEY_ARM_SPEED: f64 = 200.0;

// Recording history depth (undo/redo snapshots)
pub const MAX_HISTORY: usize = 20;

// Calibration timing
pub const STEP_START_DELAY: Duration = Duration::from_millis(100);
pub const INTER_STEP_DELAY: Duration = Duration::from_millis(500);
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const STEP_TIMEOUT_SIM: Duration = Duration::from_millis(2000);
pub const STEP_TIMEOUT_HW: Duration = Duration::from_millis(10000);
pub const MAX_STEP_ATTEMPTS: u32 = 3;

// Minimum accepted overall calibration quality (percent)
pub const QUALITY_THRESHOLD: f64 = 75.0;

// Probe magnitudes for calibration runs (device units)
pub const PROBE_DRIVE_SPEED: f64 = 200.0;
pub const PROBE_TURN_RATE: f64 = 100.0;

// Serial port for the hub link
pub const DEFAULT_HUB_PORT: &str = "/dev/ttyACM0";

// Where saved runs live
pub const DEFAULT_RUNS_DIR: &str = "saved_runs";

// Simulated workspace size (device units)
pub const WORKSPACE_WIDTH: f64 = 800.0;
pub const WORKSPACE_HEIGHT: f64 = 600.0;
