//! Progress estimation for a running sync.
//!
//! A sync is divided into weighted phases; the weights were obtained by
//! profiling many usage scenarios in the ancestor implementation and are
//! kept as tunable constants. The estimator self-adapts: when a phase needs
//! more message round trips or carries more items than assumed, its unit
//! count grows and the projection is recomputed, keeping the reported
//! percentage monotonic non-decreasing.

use sync_api::models::SyncMode;

/// Ratio of the preparation phase to one standard send/receive unit.
pub const PREPARE_RATIO: f32 = 0.2;
/// Data preparation before sending items.
pub const DATA_PREPARE_RATIO: f32 = 0.1;
/// Sending one data item.
pub const ONEITEM_SEND_RATIO: f32 = 0.05;
/// Receiving and parsing one data item.
pub const ONEITEM_RECEIVE_RATIO: f32 = 0.05;
/// Transport connection setup.
pub const CONN_SETUP_RATIO: f32 = 0.5;
/// Assumed number of items per direction until the real count is known.
pub const DEFAULT_ITEMS: i32 = 5;
/// Assumed message round trips per phase.
pub const MSG_SEND_RECEIVE_TIMES: i32 = 1;

/// The coarse steps of a sync, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Invalid = 0,
    /// Source and engine preparation.
    Prepare = 1,
    /// Connection setup, session start, authentication.
    Init = 2,
    /// Prepare and send local changes, receive peer data.
    Data = 3,
    /// Handle received items, send statuses, close the session.
    Uninit = 4,
}

const STEP_COUNT: usize = 5;

/// Whether items can flow to us, to the peer, or both; folds the sync
/// direction into the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalMode {
    None,
    OnlyToClient,
    OnlyToServer,
    TwoWay,
}

pub struct ProgressData {
    progress: i32,
    step: Step,
    send_counts: i32,
    internal_mode: InternalMode,
    /// Cumulative proportion reached at the end of each step.
    sync_prop: [f32; STEP_COUNT],
    /// Remaining units of each step.
    sync_units: [f32; STEP_COUNT],
    /// Proportion of one standard unit, adapted as units grow.
    prop_of_unit: f32,
    /// Current source during item receive, to notice source switches.
    source: String,
}

fn default_units(step: usize) -> f32 {
    match step {
        s if s == Step::Prepare as usize => PREPARE_RATIO,
        s if s == Step::Init as usize => CONN_SETUP_RATIO + MSG_SEND_RECEIVE_TIMES as f32,
        s if s == Step::Data as usize => {
            ONEITEM_SEND_RATIO * DEFAULT_ITEMS as f32
                + DATA_PREPARE_RATIO
                + MSG_SEND_RECEIVE_TIMES as f32
        }
        s if s == Step::Uninit as usize => {
            ONEITEM_RECEIVE_RATIO * DEFAULT_ITEMS as f32
                + DATA_PREPARE_RATIO
                + MSG_SEND_RECEIVE_TIMES as f32
        }
        _ => 0.0,
    }
}

impl Default for ProgressData {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressData {
    pub fn new() -> Self {
        let mut sync_units = [0f32; STEP_COUNT];
        let mut total_units = 0f32;
        for (i, unit) in sync_units.iter_mut().enumerate() {
            *unit = default_units(i);
            total_units += *unit;
        }

        // each step's entry holds the proportions of its predecessors plus
        // itself; the last step always ends at 1.0
        let mut sync_prop = [0f32; STEP_COUNT];
        for i in 1..STEP_COUNT - 1 {
            sync_prop[i] = sync_prop[i - 1] + sync_units[i] / total_units;
        }
        sync_prop[STEP_COUNT - 1] = 1.0;

        ProgressData {
            progress: 0,
            step: Step::Invalid,
            send_counts: 0,
            internal_mode: InternalMode::None,
            sync_prop,
            sync_units,
            prop_of_unit: 1.0 / total_units,
            source: String::new(),
        }
    }

    /// Current percentage, 0..=100, monotonic non-decreasing.
    pub fn percent(&self) -> i32 {
        self.progress.clamp(0, 100)
    }

    /// Enter a new step; progress snaps to the end of the previous one.
    pub fn set_step(&mut self, step: Step) {
        if self.step != step {
            self.progress = (100.0 * self.sync_prop[self.step as usize]) as i32;
            self.step = step;
            self.send_counts = 0;
            self.source.clear();
        }
    }

    /// Note the sync mode of one source; affects which directions carry
    /// items.
    pub fn add_sync_mode(&mut self, mode: SyncMode) {
        use InternalMode::*;
        let dir = match mode {
            SyncMode::TwoWay | SyncMode::Slow => TwoWay,
            // items flow only towards the peer; nothing to receive
            SyncMode::OneWayFromClient | SyncMode::RefreshFromClient => OnlyToServer,
            // items flow only towards us; nothing to send
            SyncMode::OneWayFromServer | SyncMode::RefreshFromServer => OnlyToClient,
            SyncMode::Disabled => return,
        };
        self.internal_mode = match (self.internal_mode, dir) {
            (None, d) => d,
            (TwoWay, _) | (_, TwoWay) => TwoWay,
            (a, b) if a == b => a,
            _ => TwoWay,
        };
    }

    /// A message is about to be sent.
    pub fn send_start(&mut self) {
        self.check_internal_mode();
        self.send_counts += 1;

        // more round trips than assumed: widen the current step
        if self.send_counts > MSG_SEND_RECEIVE_TIMES {
            self.sync_units[self.step as usize] += 1.0;
            self.recalc();
        }
        // sending during Uninit implies extra item handling time
        if self.step == Step::Uninit
            && self.sync_units[self.step as usize] != MSG_SEND_RECEIVE_TIMES as f32
        {
            self.update_prog(DATA_PREPARE_RATIO);
        }
    }

    /// A reply message has been fully received.
    pub fn receive_end(&mut self) {
        self.update_prog(self.sync_units[self.step as usize]);
    }

    /// Local data is being prepared for sending; only the first call per
    /// step costs time.
    pub fn item_prepare(&mut self) {
        self.check_internal_mode();
        if self.source.is_empty() {
            self.source = "source".to_string();
            self.update_prog(DATA_PREPARE_RATIO);
        }
    }

    /// One incoming item of `source` was processed; `total` is the peer's
    /// announced count for that source (0 if unknown).
    pub fn item_receive(&mut self, source: &str, _count: i32, total: i32) {
        if self.source.is_empty() {
            self.source = source.to_string();
            if total != 0 {
                self.sync_units[Step::Uninit as usize] +=
                    ONEITEM_RECEIVE_RATIO * (total - DEFAULT_ITEMS) as f32;
                self.recalc();
            }
        } else if self.source != source {
            self.source = source.to_string();
            if total != 0 {
                self.sync_units[Step::Uninit as usize] += ONEITEM_RECEIVE_RATIO * total as f32;
                self.recalc();
            }
        }
        self.update_prog(ONEITEM_RECEIVE_RATIO);
    }

    /// The sync finished; pin to 100%.
    pub fn done(&mut self) {
        self.progress = 100;
    }

    fn update_prog(&mut self, ratio: f32) {
        self.progress += (self.prop_of_unit * 100.0 * ratio) as i32;
        self.sync_units[self.step as usize] -= ratio;
    }

    /// Adapt step proportions to the units seen so far.
    fn recalc(&mut self) {
        let units = self.remaining_units();
        if units.abs() < f32::EPSILON {
            self.prop_of_unit = 0.0;
        } else {
            self.prop_of_unit = (100.0 - self.progress as f32) / (100.0 * units);
        }
        let step = self.step as usize;
        if step != STEP_COUNT - 1 {
            self.sync_prop[step] =
                self.progress as f32 / 100.0 + self.sync_units[step] * self.prop_of_unit;
            for i in step + 1..STEP_COUNT - 1 {
                self.sync_prop[i] = self.sync_prop[i - 1] + self.sync_units[i] * self.prop_of_unit;
            }
        }
    }

    fn check_internal_mode(&mut self) {
        match self.internal_mode {
            InternalMode::None | InternalMode::TwoWay => {}
            InternalMode::OnlyToClient => {
                // nothing flows to the peer: drop the send units
                self.sync_units[Step::Data as usize] -=
                    ONEITEM_RECEIVE_RATIO * DEFAULT_ITEMS as f32 + DATA_PREPARE_RATIO;
                self.recalc();
            }
            InternalMode::OnlyToServer => {
                // nothing flows to us: drop the receive units
                self.sync_units[Step::Uninit as usize] -=
                    ONEITEM_RECEIVE_RATIO * DEFAULT_ITEMS as f32 + DATA_PREPARE_RATIO;
                self.recalc();
            }
        }
        self.internal_mode = InternalMode::None;
    }

    fn remaining_units(&self) -> f32 {
        (self.step as usize..STEP_COUNT)
            .map(|i| self.sync_units[i])
            .sum()
    }
}
