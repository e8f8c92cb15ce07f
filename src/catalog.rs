//! The simulated BL02 beamline: storage ring diagnostics, an X-ray
//! shutter, three detectors, a four-axis sample stage, and a
//! monochromator.
//!
//! The catalog is illustrative; the registry mechanism does not depend
//! on it. Registration order is fixed because `LIST` reports names in
//! that order.

use tracing::info;

use crate::registry::{MotorSpec, PvKind, PvSpec, Registry, SimLaw};

/// Build a registry populated with the BL02 device catalog.
pub fn beamline() -> Registry {
    let mut registry = Registry::new();
    populate(&mut registry);
    registry
}

/// Same catalog with deterministic sensor noise, for tests.
pub fn beamline_seeded(seed: u64) -> Registry {
    let mut registry = Registry::seeded(seed);
    populate(&mut registry);
    registry
}

fn populate(registry: &mut Registry) {
    let ring = registry.add_pv(PvSpec {
        name: "BL02:RING:CURRENT",
        kind: PvKind::AnalogIn,
        range: (0.0, 400.0),
        writable: false,
        law: Some(SimLaw::RingCurrent),
    });
    registry.add_pv(PvSpec {
        name: "BL02:VACUUM:PRESSURE",
        kind: PvKind::AnalogIn,
        range: (1e-10, 1e-8),
        writable: false,
        law: Some(SimLaw::VacuumPressure),
    });
    registry.add_pv(PvSpec {
        name: "BL02:HUTCH:TEMP",
        kind: PvKind::AnalogIn,
        range: (20.0, 26.0),
        writable: false,
        law: Some(SimLaw::HutchTemp { drift: 0.0 }),
    });

    // Ion chambers and the fluorescence detector all scale with the
    // ring current.
    registry.add_pv(PvSpec {
        name: "BL02:DET:I0",
        kind: PvKind::AnalogIn,
        range: (0.0, 1e6),
        writable: false,
        law: Some(SimLaw::Detector {
            base: 5e5,
            amplitude: 1e4,
            source: ring,
        }),
    });
    registry.add_pv(PvSpec {
        name: "BL02:DET:IT",
        kind: PvKind::AnalogIn,
        range: (0.0, 1e6),
        writable: false,
        law: Some(SimLaw::Detector {
            base: 4.5e5,
            amplitude: 1e4,
            source: ring,
        }),
    });
    registry.add_pv(PvSpec {
        name: "BL02:DET:IF",
        kind: PvKind::AnalogIn,
        range: (0.0, 1e5),
        writable: false,
        law: Some(SimLaw::Detector {
            base: 5e4,
            amplitude: 1e3,
            source: ring,
        }),
    });

    // The shutter status follows its command PV on the next tick. The
    // status registers first, so its law is installed once the command
    // PV has an index.
    let status = registry.add_pv(PvSpec {
        name: "BL02:SHUTTER:STATUS",
        kind: PvKind::BinaryIn,
        range: (0.0, 1.0),
        writable: false,
        law: None,
    });
    let command = registry.add_pv(PvSpec {
        name: "BL02:SHUTTER:CMD",
        kind: PvKind::BinaryOut,
        range: (0.0, 1.0),
        writable: true,
        law: None,
    });
    if let Some(status) = status {
        registry.install_law(status, SimLaw::Follow { source: command });
    }

    registry.add_motor(MotorSpec {
        name: "BL02:SAMPLE:X",
        range: (-10000.0, 10000.0),
        velocity: 1000.0,
        initial: 0.0,
        instant_readback: false,
    });
    registry.add_motor(MotorSpec {
        name: "BL02:SAMPLE:Y",
        range: (-10000.0, 10000.0),
        velocity: 1000.0,
        initial: 0.0,
        instant_readback: false,
    });
    registry.add_motor(MotorSpec {
        name: "BL02:SAMPLE:Z",
        range: (-5000.0, 5000.0),
        velocity: 1000.0,
        initial: 0.0,
        instant_readback: false,
    });
    registry.add_motor(MotorSpec {
        name: "BL02:SAMPLE:THETA",
        range: (-180.0, 180.0),
        velocity: 10.0,
        initial: 0.0,
        instant_readback: false,
    });
    // The monochromator energy responds instantly to direct writes; a
    // commanded MOVE still sweeps at the configured rate.
    registry.add_motor(MotorSpec {
        name: "BL02:MONO:ENERGY",
        range: (4000.0, 20000.0),
        velocity: 100.0,
        initial: 8000.0,
        instant_readback: true,
    });

    info!(
        "initialized {} process variables, {} motors",
        registry.pv_count(),
        registry.motor_count()
    );
}
