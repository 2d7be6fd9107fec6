// Command dispatcher
//
// Maps d-pad and speed-slider gestures onto short text commands and hands
// them to the link manager. Visual state (which direction is lit, what the
// speed readout says) lives here; transmission policy lives in the link.
//
// Wire format (UTF-8, no framing, no acknowledgement):
//   <token>        direction or stop
//   V:<n>          speed
//   NAME:<name>\n  rename (serial only)

use crate::link::LinkManager;
use crate::settings::ControlSettings;
use std::collections::BTreeSet;
use std::fmt;

/// A short text directive for the robot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Direction(String),
    Stop(String),
    Speed(u16),
    Rename(String),
}

impl Command {
    /// Bytes-on-the-wire representation.
    pub fn encode(&self) -> String {
        match self {
            Command::Direction(token) | Command::Stop(token) => token.clone(),
            Command::Speed(value) => format!("V:{value}"),
            Command::Rename(name) => format!("NAME:{name}\n"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode().trim_end())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Forward,
        Direction::Backward,
        Direction::Left,
        Direction::Right,
    ];

    pub fn token<'a>(&self, config: &'a ControlSettings) -> &'a str {
        match self {
            Direction::Forward => &config.forward,
            Direction::Backward => &config.backward,
            Direction::Left => &config.left,
            Direction::Right => &config.right,
        }
    }
}

/// Speed slider: live movement updates the readout, a commit transmits.
#[derive(Clone, Debug)]
pub struct SpeedControl {
    value: u16,
    min: u16,
    max: u16,
    step: u16,
}

impl SpeedControl {
    pub fn new(config: &ControlSettings) -> Self {
        let (min, max) = if config.speed_min <= config.speed_max {
            (config.speed_min, config.speed_max)
        } else {
            (config.speed_max, config.speed_min)
        };
        Self {
            value: config.speed_initial.clamp(min, max),
            min,
            max,
            step: config.speed_step.max(1),
        }
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Fraction of the range, for gauges.
    pub fn ratio(&self) -> f64 {
        if self.max == self.min {
            return 1.0;
        }
        f64::from(self.value - self.min) / f64::from(self.max - self.min)
    }

    /// Move the slider to `value` (clamped). Returns the new readout.
    pub fn input(&mut self, value: u16) -> u16 {
        self.value = value.clamp(self.min, self.max);
        self.value
    }

    /// Move the slider by `steps` increments (negative = down).
    pub fn nudge(&mut self, steps: i32) -> u16 {
        let target = i32::from(self.value) + steps * i32::from(self.step);
        let target = target.clamp(i32::from(self.min), i32::from(self.max));
        self.input(target as u16)
    }
}

pub struct CommandDispatcher {
    link: LinkManager,
    config: ControlSettings,
    active: BTreeSet<Direction>,
    speed: SpeedControl,
}

impl CommandDispatcher {
    pub fn new(link: LinkManager, config: ControlSettings) -> Self {
        let speed = SpeedControl::new(&config);
        Self {
            link,
            config,
            active: BTreeSet::new(),
            speed,
        }
    }

    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    pub fn is_active(&self, direction: Direction) -> bool {
        self.active.contains(&direction)
    }

    pub fn speed(&self) -> &SpeedControl {
        &self.speed
    }

    pub fn send_stop_on_release(&self) -> bool {
        self.config.send_stop_on_release
    }

    /// Direction pressed: light it and send its token.
    pub async fn press(&mut self, direction: Direction) {
        self.active.insert(direction);
        let command = Command::Direction(direction.token(&self.config).to_string());
        self.link.send(&command).await;
    }

    /// Direction released: clear it. Only sends the stop token when
    /// `send_stop_on_release` is set and the direction was actually held.
    pub async fn release(&mut self, direction: Direction) {
        let was_active = self.active.remove(&direction);
        if was_active && self.config.send_stop_on_release {
            let command = Command::Stop(self.config.stop.clone());
            self.link.send(&command).await;
        }
    }

    /// Clear every lit direction without transmitting (focus loss).
    pub fn release_all_visual(&mut self) {
        self.active.clear();
    }

    /// Live slider movement. Updates the readout only.
    pub fn slider_input(&mut self, value: u16) -> u16 {
        self.speed.input(value)
    }

    pub fn slider_nudge(&mut self, steps: i32) -> u16 {
        self.speed.nudge(steps)
    }

    /// Slider change committed: send `V:<value>` once.
    pub async fn slider_commit(&mut self) {
        let command = Command::Speed(self.speed.value());
        self.link.send(&command).await;
    }
}
