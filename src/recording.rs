// Timestamped command recording with bounded undo/redo, and replay of a
// saved log by elapsed time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;
use std::{fs, mem};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::{Command, RecordedCommand};
use crate::config::MAX_HISTORY;
use crate::dispatch::Dispatcher;
use crate::error::{ConsoleError, Result};
use crate::robot_config::RobotConfig;

/// Captures commands with elapsed timestamps while active.
///
/// Every capture snapshots the whole buffer onto the undo stack first, so
/// undo/redo move between full buffer states (linear history, 20 deep).
pub struct Recorder {
    commands: Vec<RecordedCommand>,
    undo: VecDeque<Vec<RecordedCommand>>,
    redo: Vec<Vec<RecordedCommand>>,
    started_at: Option<Instant>,
    active: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            undo: VecDeque::new(),
            redo: Vec::new(),
            started_at: None,
            active: false,
        }
    }

    /// Clear the buffer and start the elapsed clock
    pub fn start(&mut self, now: Instant) {
        self.commands.clear();
        self.undo.clear();
        self.redo.clear();
        self.started_at = Some(now);
        self.active = true;
    }

    /// Freeze the buffer; it stays available for saving
    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Append a command with its elapsed timestamp, if recording
    pub fn capture(&mut self, command: &Command, now: Instant) {
        if !self.active {
            return;
        }
        let Some(start) = self.started_at else {
            return;
        };
        self.push_undo_snapshot(self.commands.clone());
        self.redo.clear();
        let timestamp = now.duration_since(start).as_secs_f64();
        self.commands.push(RecordedCommand::new(timestamp, command));
    }

    fn push_undo_snapshot(&mut self, snapshot: Vec<RecordedCommand>) {
        self.undo.push_back(snapshot);
        if self.undo.len() > MAX_HISTORY {
            self.undo.pop_front();
        }
    }

    /// Restore the previous buffer state; returns false if nothing to undo
    pub fn undo(&mut self) -> bool {
        if !self.active {
            return false;
        }
        match self.undo.pop_back() {
            Some(previous) => {
                self.redo.push(mem::replace(&mut self.commands, previous));
                true
            }
            None => false,
        }
    }

    /// Mirror of `undo`
    pub fn redo(&mut self) -> bool {
        if !self.active {
            return false;
        }
        match self.redo.pop() {
            Some(next) => {
                let current = mem::replace(&mut self.commands, next);
                self.push_undo_snapshot(current);
                true
            }
            None => false,
        }
    }

    /// Take the frozen buffer for saving, clearing the recorder
    pub fn take(&mut self) -> Result<Vec<RecordedCommand>> {
        if self.commands.is_empty() {
            return Err(ConsoleError::EmptyRecording);
        }
        self.undo.clear();
        self.redo.clear();
        self.started_at = None;
        Ok(mem::take(&mut self.commands))
    }
}

/// Recording file schema: `{name, timestamp, config, commands}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRun {
    pub name: String,
    pub timestamp: String,
    pub config: RobotConfig,
    pub commands: Vec<RecordedCommand>,
}

impl SavedRun {
    pub fn new(name: &str, config: RobotConfig, commands: Vec<RecordedCommand>) -> Self {
        Self {
            name: name.to_string(),
            timestamp: chrono::Local::now().to_rfc3339(),
            config,
            commands,
        }
    }

    /// Write the run as pretty JSON under `dir`, returning the file path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let filename = format!("{}_{}.json", self.name.replace(' ', "_"), stamp);
        let path = dir.join(filename);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        info!("Run saved: {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Saved run files under `dir`, newest first
    pub fn list(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut runs = Vec::new();
        if !dir.exists() {
            return Ok(runs);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                runs.push(path);
            }
        }
        runs.sort();
        runs.reverse();
        Ok(runs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Completed,
    Fault,
}

/// Replays a loaded run against the dispatcher by elapsed time
pub struct Playback {
    commands: Vec<RecordedCommand>,
    index: usize,
    started_at: Option<Instant>,
    playing: bool,
    name: String,
}

impl Playback {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            index: 0,
            started_at: None,
            playing: false,
            name: String::new(),
        }
    }

    pub fn load(&mut self, run: SavedRun) {
        self.commands = run.commands;
        self.name = run.name;
        self.index = 0;
        self.started_at = None;
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Begin replay from the start of the loaded log
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.playing {
            return Err(ConsoleError::PlaybackBusy);
        }
        if self.commands.is_empty() {
            return Err(ConsoleError::EmptyRun);
        }
        self.index = 0;
        self.started_at = Some(now);
        self.playing = true;
        info!("Starting playback: {}", self.name);
        Ok(())
    }

    /// Halt replay; takes effect before any further dispatch
    pub fn stop(&mut self) {
        self.playing = false;
        self.started_at = None;
        self.index = 0;
    }

    /// Dispatch every command whose timestamp has come due, in log order
    pub fn poll(&mut self, now: Instant, dispatcher: &mut Dispatcher) -> PlaybackStatus {
        if !self.playing {
            return PlaybackStatus::Idle;
        }
        let Some(started) = self.started_at else {
            warn!("Playback state inconsistent: playing without a start time");
            self.stop();
            return PlaybackStatus::Fault;
        };
        if self.index > self.commands.len() {
            warn!("Playback cursor out of bounds: {} > {}", self.index, self.commands.len());
            self.stop();
            return PlaybackStatus::Fault;
        }

        let elapsed = now.duration_since(started).as_secs_f64();
        while self.index < self.commands.len() && self.commands[self.index].timestamp <= elapsed {
            let entry = &self.commands[self.index];
            match entry.to_command() {
                Some(command) => dispatcher.dispatch(command, now),
                None => warn!("Skipping unknown command type: {}", entry.command_type),
            }
            self.index += 1;
        }

        if self.index >= self.commands.len() {
            self.playing = false;
            info!("Playback completed");
            return PlaybackStatus::Completed;
        }
        PlaybackStatus::Playing
    }
}
