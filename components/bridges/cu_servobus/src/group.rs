//! Group transactions: one bus round trip reading or writing the same
//! register on many servos, with a bounded retry budget.

use crate::error::{Result, ServoBusError};
use crate::protocol::{SyncReadRequest, SyncWriteFrame};
use crate::registers::RegisterDescriptor;
use crate::transport::{BusTransport, SerialSettings};
use crate::ServoId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// How many times a group transaction is attempted and how long to wait
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(10),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

type BuilderKey = (RegisterDescriptor, Vec<ServoId>);

/// Owns the transport and the cached request builders.
///
/// Builders are keyed by register and id list. They are dropped whenever
/// the transport is opened or closed, so a fresh connection always starts
/// from freshly built requests.
pub struct GroupEngine<T> {
    transport: T,
    policy: RetryPolicy,
    readers: HashMap<BuilderKey, SyncReadRequest>,
    writers: HashMap<BuilderKey, SyncWriteFrame>,
}

impl<T: BusTransport> GroupEngine<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            readers: HashMap::new(),
            writers: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn open(&mut self, settings: &SerialSettings) -> Result<()> {
        self.invalidate();
        self.transport.open(settings)
    }

    pub fn close(&mut self) {
        self.invalidate();
        self.transport.close();
    }

    fn invalidate(&mut self) {
        self.readers.clear();
        self.writers.clear();
    }

    /// Read `register` from every id in one round trip.
    ///
    /// Either every id yields a value or the whole call fails.
    pub fn group_read(
        &mut self,
        register: RegisterDescriptor,
        ids: &[ServoId],
    ) -> Result<BTreeMap<ServoId, u32>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let request = match self.readers.entry((register, ids.to_vec())) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let request = SyncReadRequest::new(register, ids)?;
                e.insert(request)
            }
        };
        let request = &*request;

        let transport = &mut self.transport;
        let values = with_retry(self.policy, register, || {
            let response = transport.exchange(request.packet(), request.response_len())?;
            request.parse_response(&response)
        })?;
        Ok(values.into_iter().collect())
    }

    /// Write one value per id to `register` in one round trip.
    pub fn group_write(
        &mut self,
        register: RegisterDescriptor,
        values: &BTreeMap<ServoId, u32>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let ids: Vec<ServoId> = values.keys().copied().collect();
        let key = (register, ids);
        let frame = match self.writers.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let frame = SyncWriteFrame::new(register, &e.key().1)?;
                e.insert(frame)
            }
        };
        for (index, value) in values.values().enumerate() {
            frame.set_value(index, *value)?;
        }

        let transport = &mut self.transport;
        let frame = &*frame;
        with_retry(self.policy, register, || {
            transport.exchange(frame.packet(), 0).map(|_| ())
        })
    }

    pub fn read_one(&mut self, register: RegisterDescriptor, id: ServoId) -> Result<u32> {
        self.group_read(register, &[id])?
            .remove(&id)
            .ok_or_else(|| ServoBusError::CommFailure(format!("no value for servo {id}")))
    }

    pub fn write_one(&mut self, register: RegisterDescriptor, id: ServoId, value: u32) -> Result<()> {
        self.group_write(register, &BTreeMap::from([(id, value)]))
    }

    /// Write the same value to every id.
    pub fn broadcast(
        &mut self,
        register: RegisterDescriptor,
        ids: &[ServoId],
        value: u32,
    ) -> Result<()> {
        let values = ids.iter().map(|&id| (id, value)).collect();
        self.group_write(register, &values)
    }
}

fn with_retry<R>(
    policy: RetryPolicy,
    register: RegisterDescriptor,
    mut attempt: impl FnMut() -> Result<R>,
) -> Result<R> {
    let attempts = policy.max_attempts.max(1);
    let mut last = String::new();
    for n in 1..=attempts {
        if n > 1 && !policy.backoff.is_zero() {
            std::thread::sleep(policy.backoff);
        }
        match attempt() {
            Ok(r) => {
                if n > 1 {
                    debug!("{} succeeded on attempt {n}", register.name);
                }
                return Ok(r);
            }
            Err(e) if e.is_transient() => {
                debug!("{} attempt {n}/{attempts} failed: {e}", register.name);
                last = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }
    warn!("{} gave up after {attempts} attempts: {last}", register.name);
    Err(ServoBusError::Communication {
        register: register.name,
        attempts,
        last,
    })
}
