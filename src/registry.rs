//! Process-variable registry and device simulation.
//!
//! The registry owns every PV in two flat arenas: a `Vec` of PVs and a
//! `Vec` of motors holding stable indices into the PV arena (a motor
//! references its setpoint, readback and done-moving PVs by index, never
//! by pointer). Lookup is a linear scan; the registry is small and `LIST`
//! must iterate in registration order anyway.
//!
//! Sensor behavior is a closed set of [`SimLaw`]s evaluated on every
//! tick, rather than arbitrary callbacks, so each law can be exercised
//! directly in tests.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use thiserror::Error;
use tracing::error;

/// Capacity of the PV arena; registrations beyond this are refused.
pub const MAX_PVS: usize = 128;
/// Maximum PV name length in bytes, wire terminator included.
pub const PV_NAME_MAX: usize = 64;

/// Distance at which a moving axis snaps onto its target.
const MOTION_EPSILON: f64 = 1e-3;

/// What a PV represents, following the AI/AO/BI/BO record convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvKind {
    /// Read-only analog sensor.
    AnalogIn,
    /// Writable analog setpoint.
    AnalogOut,
    /// Read-only binary readback.
    BinaryIn,
    /// Writable binary command.
    BinaryOut,
}

/// A named, bounded scalar exposed over the wire.
#[derive(Debug, Clone)]
pub struct Pv {
    name: String,
    kind: PvKind,
    value: f64,
    min: f64,
    max: f64,
    writable: bool,
    law: Option<SimLaw>,
}

impl Pv {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PvKind {
        self.kind
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

/// Per-tick evolution rule for a sensor PV. Laws that read another PV
/// hold its arena index; a `None` source leaves the value untouched.
#[derive(Debug, Clone, Copy)]
pub enum SimLaw {
    /// Storage ring current: 350 with a little flicker.
    RingCurrent,
    /// Chamber pressure, log-normal around 10^-8.3.
    VacuumPressure,
    /// Hutch temperature: Brownian drift around 23 degrees.
    HutchTemp { drift: f64 },
    /// Detector counts proportional to the source PV, normalized to a
    /// ring current of 350.
    Detector {
        base: f64,
        amplitude: f64,
        source: Option<usize>,
    },
    /// Instantaneous copy of the source PV.
    Follow { source: Option<usize> },
}

/// A simulated axis: three PVs plus a linear motion profile.
#[derive(Debug, Clone)]
pub struct Motor {
    setpoint: usize,
    readback: usize,
    status: usize,
    /// Slew rate in axis units per second; the profile does not
    /// accelerate.
    velocity: f64,
    target: f64,
    moving: bool,
    /// Writes to the setpoint land on the readback immediately,
    /// bypassing the motion profile.
    instant_readback: bool,
}

impl Motor {
    pub fn moving(&self) -> bool {
        self.moving
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn status_label(&self) -> &'static str {
        if self.moving { "MOVING" } else { "IDLE" }
    }
}

/// Registration parameters for a PV.
pub struct PvSpec<'a> {
    pub name: &'a str,
    pub kind: PvKind,
    pub range: (f64, f64),
    pub writable: bool,
    pub law: Option<SimLaw>,
}

/// Registration parameters for a motor. Registers the writable setpoint
/// under `name`, plus `<name>.RBV` and `<name>.DMOV`, in that order.
pub struct MotorSpec<'a> {
    pub name: &'a str,
    pub range: (f64, f64),
    pub velocity: f64,
    /// Starting position, applied to setpoint, readback and target.
    pub initial: f64,
    pub instant_readback: bool,
}

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("no such process variable")]
    UnknownPv,
    #[error("process variable is read-only")]
    ReadOnly,
    #[error("value outside the permitted range")]
    OutOfRange,
}

/// The process-wide collection of PVs and motors.
pub struct Registry {
    pvs: Vec<Pv>,
    motors: Vec<Motor>,
    rng: SmallRng,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            pvs: Vec::new(),
            motors: Vec::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// A registry with deterministic noise, for tests.
    pub fn seeded(seed: u64) -> Registry {
        Registry {
            pvs: Vec::new(),
            motors: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Register a PV, returning its arena index. Refuses (with an error
    /// log) duplicates, exhausted capacity, and inverted ranges.
    pub fn add_pv(&mut self, spec: PvSpec) -> Option<usize> {
        if self.pvs.len() >= MAX_PVS {
            error!("PV registry full, cannot register: {}", spec.name);
            return None;
        }
        if self.find_pv_index(spec.name).is_some() {
            error!("duplicate PV name refused: {}", spec.name);
            return None;
        }
        let (min, max) = spec.range;
        if !(min <= max) {
            error!("inverted range refused for PV: {}", spec.name);
            return None;
        }
        self.pvs.push(Pv {
            name: spec.name.to_string(),
            kind: spec.kind,
            value: 0.0f64.clamp(min, max),
            min,
            max,
            writable: spec.writable,
            law: spec.law,
        });
        Some(self.pvs.len() - 1)
    }

    /// Register a motor and its three PVs. The setpoint name is the
    /// motor's lookup key.
    pub fn add_motor(&mut self, spec: MotorSpec) -> Option<usize> {
        let setpoint = self.add_pv(PvSpec {
            name: spec.name,
            kind: PvKind::AnalogOut,
            range: spec.range,
            writable: true,
            law: None,
        })?;
        let readback = self.add_pv(PvSpec {
            name: &format!("{}.RBV", spec.name),
            kind: PvKind::AnalogIn,
            range: spec.range,
            writable: false,
            law: None,
        })?;
        let status = self.add_pv(PvSpec {
            name: &format!("{}.DMOV", spec.name),
            kind: PvKind::BinaryIn,
            range: (0.0, 1.0),
            writable: false,
            law: None,
        })?;
        self.pvs[setpoint].value = spec.initial;
        self.pvs[readback].value = spec.initial;
        self.motors.push(Motor {
            setpoint,
            readback,
            status,
            velocity: spec.velocity,
            target: spec.initial,
            moving: false,
            instant_readback: spec.instant_readback,
        });
        Some(self.motors.len() - 1)
    }

    /// Install (or replace) the simulation law of an already-registered
    /// PV. Used where a law references a PV registered after it.
    pub fn install_law(&mut self, index: usize, law: SimLaw) {
        if let Some(pv) = self.pvs.get_mut(index) {
            pv.law = Some(law);
        }
    }

    pub fn pv_count(&self) -> usize {
        self.pvs.len()
    }

    pub fn motor_count(&self) -> usize {
        self.motors.len()
    }

    pub fn find_pv(&self, name: &str) -> Option<&Pv> {
        self.pvs.iter().find(|pv| pv.name == name)
    }

    fn find_pv_index(&self, name: &str) -> Option<usize> {
        self.pvs.iter().position(|pv| pv.name == name)
    }

    /// Current value of a named PV.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.find_pv(name).map(Pv::value)
    }

    /// Write a value to a named PV. Read-only PVs and out-of-range
    /// values are refused without mutation; in-range boundary values are
    /// stored exactly, never clamped.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), WriteError> {
        let index = self.find_pv_index(name).ok_or(WriteError::UnknownPv)?;
        let pv = &self.pvs[index];
        if !pv.writable {
            return Err(WriteError::ReadOnly);
        }
        if value < pv.min || value > pv.max {
            return Err(WriteError::OutOfRange);
        }
        self.pvs[index].value = value;

        // Setpoints flagged for instantaneous readback mirror the write
        // straight onto the readback PV, bypassing the motion profile.
        if let Some(motor) = self
            .motors
            .iter()
            .find(|m| m.setpoint == index && m.instant_readback)
        {
            let readback = motor.readback;
            self.pvs[readback].value = value;
        }
        Ok(())
    }

    /// Comma-join the names matching `pattern`, in registration order,
    /// stopping silently once `capacity` bytes would be exceeded.
    /// Returns the joined names and the count actually written.
    pub fn list(&self, pattern: &str, capacity: usize) -> (String, usize) {
        let mut names = String::new();
        let mut count = 0;
        for pv in &self.pvs {
            if !glob_match(pattern, &pv.name) {
                continue;
            }
            let separator = usize::from(!names.is_empty());
            if names.len() + separator + pv.name.len() > capacity {
                break;
            }
            if separator == 1 {
                names.push(',');
            }
            names.push_str(&pv.name);
            count += 1;
        }
        (names, count)
    }

    /// Look up a motor by its setpoint PV name.
    pub fn find_motor(&self, name: &str) -> Option<&Motor> {
        let index = self.find_pv_index(name)?;
        self.motors.iter().find(|m| m.setpoint == index)
    }

    /// Command a motor toward `target`. Fails on an unknown motor or a
    /// target outside the setpoint's range; on success the setpoint is
    /// written and the axis starts moving on the next tick.
    pub fn motor_move(&mut self, name: &str, target: f64) -> bool {
        let Some(setpoint_index) = self.find_pv_index(name) else {
            return false;
        };
        let Some(motor_index) = self.motors.iter().position(|m| m.setpoint == setpoint_index)
        else {
            return false;
        };
        let setpoint = &self.pvs[setpoint_index];
        if target < setpoint.min || target > setpoint.max {
            return false;
        }
        self.pvs[setpoint_index].value = target;
        let motor = &mut self.motors[motor_index];
        motor.target = target;
        motor.moving = true;
        let status = motor.status;
        self.pvs[status].value = 1.0;
        true
    }

    /// Advance the simulation by `dt` seconds: evaluate every sensor law,
    /// then step every motor along its profile.
    pub fn update(&mut self, dt: f64) {
        for index in 0..self.pvs.len() {
            if let Some(law) = self.pvs[index].law {
                self.step_law(index, law);
            }
        }
        for index in 0..self.motors.len() {
            self.step_motor(index, dt);
        }
    }

    /// Uniform noise on [-amplitude/2, amplitude/2).
    fn noise(&mut self, amplitude: f64) -> f64 {
        (self.rng.gen::<f64>() - 0.5) * amplitude
    }

    fn step_law(&mut self, index: usize, law: SimLaw) {
        let next = match law {
            SimLaw::RingCurrent => Some(350.0 + self.noise(4.0)),
            SimLaw::VacuumPressure => Some(10f64.powf(-8.3 + self.noise(0.2))),
            SimLaw::HutchTemp { drift } => {
                let drift = drift + self.noise(0.01);
                self.pvs[index].law = Some(SimLaw::HutchTemp { drift });
                Some(23.0 + drift)
            }
            SimLaw::Detector {
                base,
                amplitude,
                source,
            } => source.map(|source| {
                let factor = self.pvs[source].value / 350.0;
                base * factor + self.noise(amplitude)
            }),
            SimLaw::Follow { source } => source.map(|source| self.pvs[source].value),
        };
        if let Some(value) = next {
            let pv = &mut self.pvs[index];
            pv.value = value.clamp(pv.min, pv.max);
        }
    }

    fn step_motor(&mut self, index: usize, dt: f64) {
        let motor = &self.motors[index];
        if !motor.moving {
            return;
        }
        let (readback, status, target, velocity) =
            (motor.readback, motor.status, motor.target, motor.velocity);
        let current = self.pvs[readback].value;
        let diff = target - current;
        let step = velocity * dt;
        if diff.abs() < MOTION_EPSILON || diff.abs() < step {
            self.pvs[readback].value = target;
            self.pvs[status].value = 0.0;
            self.motors[index].moving = false;
        } else {
            self.pvs[readback].value = current + diff.signum() * step;
            self.pvs[status].value = 1.0;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Glob matching where `*` matches any (possibly empty) substring and
/// everything else is literal. An empty pattern matches all. Successive
/// `*` segments bind greedy-leftmost.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let Some((prefix, rest)) = pattern.split_once('*') else {
        return pattern == name;
    };
    let Some(mut remainder) = name.strip_prefix(prefix) else {
        return false;
    };
    let segments: Vec<&str> = rest.split('*').collect();
    let (last, middle) = segments.split_last().unwrap();
    for segment in middle {
        match remainder.find(segment) {
            Some(at) => remainder = &remainder[at + segment.len()..],
            None => return false,
        }
    }
    remainder.ends_with(last)
}
