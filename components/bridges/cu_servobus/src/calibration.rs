//! Calibration data for the servos on a bus.
//!
//! Each servo has three recorded raw positions: `zero` (0°), `max` (+90°)
//! and `min` (-90°). A servo mounted in reverse simply has `max < zero < min`;
//! no separate direction flag exists.
//!
//! Two slots are kept: the committed set used for all angle math, and a
//! draft filled in point by point during a calibration session. The draft
//! replaces the committed set whole or not at all.

use crate::error::{Result, ServoBusError};
use crate::ServoId;
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Raw position as read from or written to the position registers.
pub type RawPosition = i32;

/// Which reference point of a servo is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointName {
    Zero,
    Min,
    Max,
}

impl PointName {
    pub const ALL: [PointName; 3] = [PointName::Zero, PointName::Min, PointName::Max];
}

impl fmt::Display for PointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PointName::Zero => "zero",
            PointName::Min => "min",
            PointName::Max => "max",
        })
    }
}

impl FromStr for PointName {
    type Err = ServoBusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zero" => Ok(Self::Zero),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(ServoBusError::InvalidPointName(other.to_string())),
        }
    }
}

/// Calibration for a single servo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub zero: RawPosition,
    pub min: RawPosition,
    pub max: RawPosition,
}

impl CalibrationPoint {
    pub fn get(&self, point: PointName) -> RawPosition {
        match point {
            PointName::Zero => self.zero,
            PointName::Min => self.min,
            PointName::Max => self.max,
        }
    }

    /// True when the servo is mounted so that raw values decrease toward +90°.
    pub fn is_reversed(&self) -> bool {
        self.max < self.zero
    }
}

/// Calibration for every servo on the bus, stamped with its capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSet {
    pub timestamp: DateTime<Utc>,
    pub servos: BTreeMap<ServoId, CalibrationPoint>,
}

impl CalibrationSet {
    pub fn get(&self, id: ServoId) -> Option<&CalibrationPoint> {
        self.servos.get(&id)
    }

    pub fn covers(&self, ids: &[ServoId]) -> bool {
        ids.iter().all(|id| self.servos.contains_key(id))
    }
}

/// Points captured so far for one servo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartialPoint {
    pub zero: Option<RawPosition>,
    pub min: Option<RawPosition>,
    pub max: Option<RawPosition>,
}

impl PartialPoint {
    pub fn get(&self, point: PointName) -> Option<RawPosition> {
        match point {
            PointName::Zero => self.zero,
            PointName::Min => self.min,
            PointName::Max => self.max,
        }
    }

    pub fn set(&mut self, point: PointName, value: RawPosition) {
        let slot = match point {
            PointName::Zero => &mut self.zero,
            PointName::Min => &mut self.min,
            PointName::Max => &mut self.max,
        };
        *slot = Some(value);
    }

    pub fn complete(&self) -> Option<CalibrationPoint> {
        Some(CalibrationPoint {
            zero: self.zero?,
            min: self.min?,
            max: self.max?,
        })
    }
}

/// Calibration being captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DraftCalibration {
    pub servos: BTreeMap<ServoId, PartialPoint>,
}

impl DraftCalibration {
    pub fn set(&mut self, id: ServoId, point: PointName, value: RawPosition) {
        self.servos.entry(id).or_default().set(point, value);
    }

    /// Every `(servo, point)` still missing for `ids`, in id order.
    pub fn missing(&self, ids: &[ServoId]) -> Vec<(ServoId, PointName)> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted
            .into_iter()
            .flat_map(|id| {
                let partial = self.servos.get(&id).copied().unwrap_or_default();
                PointName::ALL
                    .into_iter()
                    .filter(move |&p| partial.get(p).is_none())
                    .map(move |p| (id, p))
            })
            .collect()
    }

    /// Turn the draft into a complete set for `ids`, or report what is missing.
    pub fn finish(&self, ids: &[ServoId], timestamp: DateTime<Utc>) -> Result<CalibrationSet> {
        let missing = self.missing(ids);
        if !missing.is_empty() {
            return Err(ServoBusError::IncompleteCalibration { missing });
        }
        let servos = ids
            .iter()
            .filter_map(|&id| Some((id, self.servos.get(&id)?.complete()?)))
            .collect();
        Ok(CalibrationSet { timestamp, servos })
    }
}

/// Committed and draft calibration.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSlots {
    committed: Option<CalibrationSet>,
    draft: Option<DraftCalibration>,
}

impl CalibrationSlots {
    pub fn new(committed: Option<CalibrationSet>) -> Self {
        Self {
            committed,
            draft: None,
        }
    }

    pub fn committed(&self) -> Option<&CalibrationSet> {
        self.committed.as_ref()
    }

    pub fn draft(&self) -> Option<&DraftCalibration> {
        self.draft.as_ref()
    }

    /// Start a fresh, empty draft.
    pub fn begin(&mut self) {
        self.draft = Some(DraftCalibration::default());
    }

    pub fn record(&mut self, id: ServoId, point: PointName, value: RawPosition) -> Result<()> {
        let draft = self.draft.as_mut().ok_or(ServoBusError::CalibrationNotStarted)?;
        draft.set(id, point, value);
        Ok(())
    }

    /// Validate the draft without touching either slot.
    pub fn prepare(&self, ids: &[ServoId], timestamp: DateTime<Utc>) -> Result<CalibrationSet> {
        self.draft
            .as_ref()
            .ok_or(ServoBusError::CalibrationNotStarted)?
            .finish(ids, timestamp)
    }

    /// Replace the committed set and drop the draft.
    pub fn commit(&mut self, set: CalibrationSet) {
        self.committed = Some(set);
        self.draft = None;
    }

    pub fn discard_draft(&mut self) {
        self.draft = None;
    }
}

/// Durable home of the committed calibration.
pub trait CalibrationStore: Send {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<CalibrationSet>>;
    fn save(&mut self, set: &CalibrationSet) -> Result<()>;
}

/// Calibration stored as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CalibrationStore for JsonFileStore {
    fn load(&self) -> Result<Option<CalibrationSet>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let set = serde_json::from_str(&contents).map_err(|e| {
            ServoBusError::Store(format!("bad calibration JSON in {}: {e}", self.path.display()))
        })?;
        Ok(Some(set))
    }

    fn save(&mut self, set: &CalibrationSet) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(set)
            .map_err(|e| ServoBusError::Store(format!("encoding calibration: {e}")))?;
        // Write beside the target then rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        info!("saved calibration for {} servos to {}", set.servos.len(), self.path.display());
        Ok(())
    }
}

/// Store kept in memory, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreState>>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    set: Option<CalibrationSet>,
    saves: usize,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn new(initial: Option<CalibrationSet>) -> Self {
        let store = Self::default();
        store.inner.lock().set = initial;
        store
    }

    pub fn saved(&self) -> Option<CalibrationSet> {
        self.inner.lock().set.clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().saves
    }

    pub fn fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }
}

impl CalibrationStore for MemoryStore {
    fn load(&self) -> Result<Option<CalibrationSet>> {
        Ok(self.inner.lock().set.clone())
    }

    fn save(&mut self, set: &CalibrationSet) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_saves {
            return Err(ServoBusError::Store("simulated write failure".into()));
        }
        inner.set = Some(set.clone());
        inner.saves += 1;
        Ok(())
    }
}
