//! Runtime state tracker
//!
//! Mutable snapshot owned by one engine: station/robot states, last-known wafers,
//! robot wait targets, in-flight command flags and the named wafer queues.

use crate::types::{WaferId, COMPLETED_QUEUE, PENDING_QUEUE};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt::Write;

/// State reported by `robot_state` while a dispatched command is unacknowledged
pub const BUSY_STATE: &str = "busy";

const IDLE_STATE: &str = "idle";

/// Robot states that carry a wait target
const WAITING_STATES: [&str; 2] = ["holding", "waitingDestination"];

pub(crate) fn is_waiting_state(state: &str) -> bool {
    WAITING_STATES.iter().any(|s| s.eq_ignore_ascii_case(state))
}

#[derive(Debug, Clone)]
pub struct RuntimeState {
    station_state: FxHashMap<String, String>,
    station_wafer: FxHashMap<String, WaferId>,
    robot_state: FxHashMap<String, String>,
    robot_wafer: FxHashMap<String, WaferId>,
    robot_waiting_for: FxHashMap<String, String>,
    robots_pending_command: FxHashSet<String>,
    queues: FxHashMap<String, VecDeque<WaferId>>,
    total_wafers: usize,
    paused: bool,
    last_signature: Option<String>,
    /// Latch for the all-wafers-completed edge
    completion_signalled: bool,
}

impl RuntimeState {
    pub fn new(total_wafers: usize) -> Self {
        let mut state = Self {
            station_state: FxHashMap::default(),
            station_wafer: FxHashMap::default(),
            robot_state: FxHashMap::default(),
            robot_wafer: FxHashMap::default(),
            robot_waiting_for: FxHashMap::default(),
            robots_pending_command: FxHashSet::default(),
            queues: FxHashMap::default(),
            total_wafers,
            paused: false,
            last_signature: None,
            completion_signalled: false,
        };
        state.seed_queues();
        state
    }

    fn seed_queues(&mut self) {
        let pending: VecDeque<WaferId> = (1..=self.total_wafers as WaferId).collect();
        self.queues.insert(PENDING_QUEUE.to_string(), pending);
        self.queues
            .insert(COMPLETED_QUEUE.to_string(), VecDeque::new());
    }

    /// Clear tracking and queues, regenerate the pending sequence.
    ///
    /// The pause flag is left as is.
    pub fn reset(&mut self, total_wafers: usize) {
        self.station_state.clear();
        self.station_wafer.clear();
        self.robot_state.clear();
        self.robot_wafer.clear();
        self.robot_waiting_for.clear();
        self.robots_pending_command.clear();
        self.queues.clear();
        self.total_wafers = total_wafers;
        self.last_signature = None;
        self.completion_signalled = false;
        self.seed_queues();
    }

    // ========== Stations ==========

    pub fn set_station_status(&mut self, station: &str, state: &str, wafer_id: Option<WaferId>) {
        self.station_state
            .insert(station.to_string(), state.to_string());
        match wafer_id {
            Some(id) => {
                self.station_wafer.insert(station.to_string(), id);
            },
            None => {
                self.station_wafer.remove(station);
            },
        }
    }

    pub fn station_state(&self, station: &str) -> Option<&str> {
        self.station_state.get(station).map(String::as_str)
    }

    pub fn station_wafer(&self, station: &str) -> Option<WaferId> {
        self.station_wafer.get(station).copied()
    }

    // ========== Robots ==========

    /// Record a robot report.
    ///
    /// Any non-idle report acknowledges an in-flight command. A bare `idle` does
    /// not, since the first idle after dispatch may predate the command.
    pub fn set_robot_status(
        &mut self,
        robot: &str,
        state: &str,
        wafer_id: Option<WaferId>,
        waiting_for: Option<&str>,
    ) {
        self.robot_state.insert(robot.to_string(), state.to_string());
        match wafer_id {
            Some(id) => {
                self.robot_wafer.insert(robot.to_string(), id);
            },
            None => {
                self.robot_wafer.remove(robot);
            },
        }

        if !state.eq_ignore_ascii_case(IDLE_STATE) {
            self.clear_command_dispatched(robot);
        }

        match waiting_for {
            Some(target) if is_waiting_state(state) => {
                self.robot_waiting_for
                    .insert(robot.to_string(), target.to_string());
            },
            _ => {
                self.robot_waiting_for.remove(robot);
            },
        }
    }

    /// Last reported state, or `busy` while a command is in flight
    pub fn robot_state(&self, robot: &str) -> Option<&str> {
        if self.robots_pending_command.contains(robot) {
            return Some(BUSY_STATE);
        }
        self.robot_state.get(robot).map(String::as_str)
    }

    pub fn robot_wafer(&self, robot: &str) -> Option<WaferId> {
        self.robot_wafer.get(robot).copied()
    }

    pub fn mark_command_dispatched(&mut self, robot: &str) {
        self.robots_pending_command.insert(robot.to_string());
    }

    pub fn clear_command_dispatched(&mut self, robot: &str) {
        self.robots_pending_command.remove(robot);
    }

    pub fn is_command_pending(&self, robot: &str) -> bool {
        self.robots_pending_command.contains(robot)
    }

    pub fn pending_command_robots(&self) -> Vec<String> {
        let mut robots: Vec<String> = self.robots_pending_command.iter().cloned().collect();
        robots.sort();
        robots
    }

    // ========== Wait targets ==========

    pub fn waiting_for(&self, robot: &str) -> Option<&str> {
        self.robot_waiting_for.get(robot).map(String::as_str)
    }

    pub fn clear_waiting(&mut self, robot: &str) {
        self.robot_waiting_for.remove(robot);
    }

    /// Robots blocked on `destination`, sorted by name
    pub fn robots_waiting_for(&self, destination: &str) -> Vec<String> {
        let mut robots: Vec<String> = self
            .robot_waiting_for
            .iter()
            .filter(|(_, target)| target.as_str() == destination)
            .map(|(robot, _)| robot.clone())
            .collect();
        robots.sort();
        robots
    }

    /// All wait records as (robot, destination), sorted by robot
    pub fn waiting_robots(&self) -> Vec<(String, String)> {
        let mut waiting: Vec<(String, String)> = self
            .robot_waiting_for
            .iter()
            .map(|(r, d)| (r.clone(), d.clone()))
            .collect();
        waiting.sort();
        waiting
    }

    // ========== Queues ==========

    pub fn queue(&self, name: &str) -> Option<&VecDeque<WaferId>> {
        self.queues.get(name)
    }

    /// Queue by name, created empty on first use
    pub fn queue_mut(&mut self, name: &str) -> &mut VecDeque<WaferId> {
        self.queues.entry(name.to_string()).or_default()
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, VecDeque::len)
    }

    pub fn total_wafers(&self) -> usize {
        self.total_wafers
    }

    // ========== Run control ==========

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn last_signature(&self) -> Option<&str> {
        self.last_signature.as_deref()
    }

    pub fn set_last_signature(&mut self, signature: Option<String>) {
        self.last_signature = signature;
    }

    pub(crate) fn completion_signalled(&self) -> bool {
        self.completion_signalled
    }

    pub(crate) fn set_completion_signalled(&mut self, signalled: bool) {
        self.completion_signalled = signalled;
    }

    /// Compact digest of every tracked state and wafer plus queue lengths.
    ///
    /// Equal signatures mean no rule can have become newly eligible.
    pub fn signature(&self) -> String {
        let mut sig = String::with_capacity(128);

        let mut robots: Vec<&String> = self.robot_state.keys().collect();
        robots.sort();
        for robot in robots {
            let _ = write!(
                sig,
                "{}:{}:{};",
                robot,
                self.robot_state[robot],
                self.robot_wafer.get(robot).copied().unwrap_or(0)
            );
        }
        sig.push('|');

        let mut stations: Vec<&String> = self.station_state.keys().collect();
        stations.sort();
        for station in stations {
            let _ = write!(
                sig,
                "{}:{}:{};",
                station,
                self.station_state[station],
                self.station_wafer.get(station).copied().unwrap_or(0)
            );
        }
        sig.push('|');

        let mut queues: Vec<(&String, usize)> =
            self.queues.iter().map(|(k, q)| (k, q.len())).collect();
        queues.sort();
        for (name, len) in queues {
            let _ = write!(sig, "{}={};", name, len);
        }

        sig
    }
}
