// Robot physical parameters plus calibration-derived correction factors

use serde::{Deserialize, Serialize};

/// Physical configuration of the robot, embedded in every saved run.
///
/// The calibration-derived fields are only meaningful while
/// `is_calibrated` is true; `clear_calibration` resets them to neutral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    // Physical parameters
    pub axle_track: f64,     // mm
    pub wheel_diameter: f64, // mm
    pub left_motor_port: String,
    pub right_motor_port: String,
    pub arm1_motor_port: String,
    pub arm2_motor_port: String,
    pub straight_speed: f64,        // mm/s
    pub straight_acceleration: f64, // mm/s^2
    pub turn_rate: f64,             // deg/s
    pub turn_acceleration: f64,     // deg/s^2

    // Calibration-derived
    pub is_calibrated: bool,
    pub calibration_date: Option<String>,
    pub left_motor_delay: f64,  // ms
    pub right_motor_delay: f64, // ms
    pub arm1_motor_delay: f64,  // ms
    pub arm2_motor_delay: f64,  // ms
    pub gyroscope_drift: f64,   // deg/s
    pub gyroscope_delay: f64,   // ms
    pub left_motor_speed_factor: f64,
    pub right_motor_speed_factor: f64,
    pub turn_accuracy_factor: f64,
    pub straight_drift_correction: f64, // deg/s
    pub motor_response_time: f64,       // ms
    pub calibration_quality: f64,       // 0-100
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            axle_track: 112.0,
            wheel_diameter: 56.0,
            left_motor_port: "A".into(),
            right_motor_port: "B".into(),
            arm1_motor_port: "C".into(),
            arm2_motor_port: "D".into(),
            straight_speed: 500.0,
            straight_acceleration: 250.0,
            turn_rate: 200.0,
            turn_acceleration: 300.0,
            is_calibrated: false,
            calibration_date: None,
            left_motor_delay: 0.0,
            right_motor_delay: 0.0,
            arm1_motor_delay: 0.0,
            arm2_motor_delay: 0.0,
            gyroscope_drift: 0.0,
            gyroscope_delay: 0.0,
            left_motor_speed_factor: 1.0,
            right_motor_speed_factor: 1.0,
            turn_accuracy_factor: 1.0,
            straight_drift_correction: 0.0,
            motor_response_time: 0.0,
            calibration_quality: 0.0,
        }
    }
}

impl RobotConfig {
    /// Drop all calibration results, keeping the physical parameters.
    pub fn clear_calibration(&mut self) {
        *self = Self {
            axle_track: self.axle_track,
            wheel_diameter: self.wheel_diameter,
            left_motor_port: self.left_motor_port.clone(),
            right_motor_port: self.right_motor_port.clone(),
            arm1_motor_port: self.arm1_motor_port.clone(),
            arm2_motor_port: self.arm2_motor_port.clone(),
            straight_speed: self.straight_speed,
            straight_acceleration: self.straight_acceleration,
            turn_rate: self.turn_rate,
            turn_acceleration: self.turn_acceleration,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_neutral() {
        let config = RobotConfig::default();
        assert!(!config.is_calibrated);
        assert_eq!(config.left_motor_speed_factor, 1.0);
        assert_eq!(config.right_motor_speed_factor, 1.0);
        assert_eq!(config.turn_accuracy_factor, 1.0);
        assert_eq!(config.straight_drift_correction, 0.0);
        assert_eq!(config.calibration_quality, 0.0);
    }

    #[test]
    fn clear_calibration_keeps_physical_parameters() {
        let mut config = RobotConfig {
            axle_track: 120.0,
            left_motor_port: "E".into(),
            is_calibrated: true,
            calibration_date: Some("2026-01-01 00:00:00".into()),
            right_motor_speed_factor: 0.98,
            straight_drift_correction: 0.3,
            calibration_quality: 90.0,
            ..RobotConfig::default()
        };
        config.clear_calibration();
        assert_eq!(config.axle_track, 120.0);
        assert_eq!(config.left_motor_port, "E");
        assert!(!config.is_calibrated);
        assert_eq!(config.calibration_date, None);
        assert_eq!(config.right_motor_speed_factor, 1.0);
        assert_eq!(config.straight_drift_correction, 0.0);
        assert_eq!(config.calibration_quality, 0.0);
    }

    #[test]
    fn serde_round_trip() {
        let mut config = RobotConfig::default();
        config.is_calibrated = true;
        config.right_motor_speed_factor = 0.97;
        let json = serde_json::to_string(&config).unwrap();
        let back: RobotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let back: RobotConfig = serde_json::from_str(r#"{"axle_track": 100.0}"#).unwrap();
        assert_eq!(back.axle_track, 100.0);
        assert_eq!(back.wheel_diameter, 56.0);
        assert_eq!(back.turn_accuracy_factor, 1.0);
    }
}
