//! Phased instructions against the init system.

use std::fmt;

use crate::allocation::{Blob, Pod, Unit, UnitFile};

/// Ordering bucket for instruction execution.
///
/// Within a batch, destroys precede deploys, file operations precede
/// enablement and enablement precedes lifecycle commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    DestroyCommand = 0,
    DestroyPerm = 1,
    DestroyFs = 2,
    DeployFs = 3,
    DeployPerm = 4,
    DeployCommand = 5,
}

/// One atomic init-system action bound to a unit file or blob.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Write the unit file and reload the init system.
    WriteUnit { unit_file: UnitFile },

    /// Enable the unit so it survives reboot.
    EnableUnit { unit_file: UnitFile },

    /// Disable the unit.
    DisableUnit { unit_file: UnitFile, phase: Phase },

    /// Run a lifecycle command and wait for completion.
    Command {
        unit_file: UnitFile,
        command: String,
        phase: Phase,
    },

    /// Remove the unit file and reload the init system.
    DeleteUnit { unit_file: UnitFile },

    /// Write a static file with its permissions.
    WriteBlob { blob: Blob },

    /// Remove a static file.
    DeleteBlob { blob: Blob },
}

impl Instruction {
    pub fn phase(&self) -> Phase {
        match self {
            Self::WriteUnit { .. } | Self::WriteBlob { .. } => Phase::DeployFs,
            Self::EnableUnit { .. } => Phase::DeployPerm,
            Self::DisableUnit { phase, .. } | Self::Command { phase, .. } => *phase,
            Self::DeleteUnit { .. } | Self::DeleteBlob { .. } => Phase::DestroyFs,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, target) = match self {
            Self::WriteUnit { unit_file } => ("write", unit_file.path.display().to_string()),
            Self::EnableUnit { unit_file } => ("enable", unit_file.path.display().to_string()),
            Self::DisableUnit { unit_file, .. } => {
                ("disable", unit_file.path.display().to_string())
            }
            Self::Command { unit_file, command, .. } => {
                (command.as_str(), unit_file.path.display().to_string())
            }
            Self::DeleteUnit { unit_file } => ("remove", unit_file.path.display().to_string()),
            Self::WriteBlob { blob } => ("write-blob", blob.name.clone()),
            Self::DeleteBlob { blob } => ("remove-blob", blob.name.clone()),
        };
        write!(f, "{}:{}:{}", self.phase() as u8, op, target)
    }
}

fn unit_create(unit: &Unit) -> Vec<Instruction> {
    let mut res = vec![Instruction::WriteUnit {
        unit_file: unit.unit_file.clone(),
    }];
    if unit.transition.permanent {
        res.push(Instruction::EnableUnit {
            unit_file: unit.unit_file.clone(),
        });
    }
    if !unit.transition.create.is_empty() {
        res.push(Instruction::Command {
            unit_file: unit.unit_file.clone(),
            command: unit.transition.create.clone(),
            phase: Phase::DeployCommand,
        });
    }
    res
}

fn unit_update(unit: &Unit) -> Vec<Instruction> {
    let mut res = vec![Instruction::WriteUnit {
        unit_file: unit.unit_file.clone(),
    }];
    if unit.transition.permanent {
        res.push(Instruction::EnableUnit {
            unit_file: unit.unit_file.clone(),
        });
    }
    if !unit.transition.update.is_empty() {
        res.push(Instruction::Command {
            unit_file: unit.unit_file.clone(),
            command: unit.transition.update.clone(),
            phase: Phase::DeployCommand,
        });
    }
    res
}

fn unit_destroy(unit: &Unit) -> Vec<Instruction> {
    let mut res = Vec::new();
    if !unit.transition.destroy.is_empty() {
        res.push(Instruction::Command {
            unit_file: unit.unit_file.clone(),
            command: unit.transition.destroy.clone(),
            phase: Phase::DestroyCommand,
        });
    }
    if unit.transition.permanent {
        res.push(Instruction::DisableUnit {
            unit_file: unit.unit_file.clone(),
            phase: Phase::DestroyPerm,
        });
    }
    res.push(Instruction::DeleteUnit {
        unit_file: unit.unit_file.clone(),
    });
    res
}

/// Instructions to create every part of a fresh pod: the wrapper unit,
/// then each unit and blob. Resource claims emit nothing; they only gate
/// eligibility.
pub fn plan_create(pod: &Pod) -> Vec<Instruction> {
    let mut res = unit_create(&pod.pod_unit());
    for unit in &pod.units {
        res.extend(unit_create(unit));
    }
    for blob in &pod.blobs {
        res.push(Instruction::WriteBlob { blob: blob.clone() });
    }
    res
}

/// Instructions to tear a pod down: stop and remove every unit and every
/// blob not marked `leave`, the wrapper unit last.
pub fn plan_destroy(pod: &Pod) -> Vec<Instruction> {
    let mut res = Vec::new();
    for unit in &pod.units {
        res.extend(unit_destroy(unit));
    }
    for blob in &pod.blobs {
        if !blob.leave {
            res.push(Instruction::DeleteBlob { blob: blob.clone() });
        }
    }
    res.extend(unit_destroy(&pod.pod_unit()));
    res
}

/// Instructions to converge `current` to `candidate`.
///
/// Content-unchanged units are left running; changed units are rewritten
/// and updated; vanished units are destroyed and new ones created. Blobs
/// follow the same diff except a blob marked `leave` is never removed.
/// The wrapper unit is always rewritten and restarted: this planner runs
/// only when the headers differ.
pub fn plan_update(current: &Pod, candidate: &Pod) -> Vec<Instruction> {
    let mut res = unit_update(&candidate.pod_unit());

    for unit in &candidate.units {
        match current
            .units
            .iter()
            .find(|u| u.unit_file.unit_name() == unit.unit_file.unit_name())
        {
            Some(existing) if existing.unit_file == unit.unit_file => {}
            Some(_) => res.extend(unit_update(unit)),
            None => res.extend(unit_create(unit)),
        }
    }
    for unit in &current.units {
        if !candidate
            .units
            .iter()
            .any(|u| u.unit_file.unit_name() == unit.unit_file.unit_name())
        {
            res.extend(unit_destroy(unit));
        }
    }

    for blob in &candidate.blobs {
        match current.blobs.iter().find(|b| b.name == blob.name) {
            Some(existing) if existing.source == blob.source
                && existing.permissions == blob.permissions => {}
            _ => res.push(Instruction::WriteBlob { blob: blob.clone() }),
        }
    }
    for blob in &current.blobs {
        if blob.leave {
            continue;
        }
        if !candidate.blobs.iter().any(|b| b.name == blob.name) {
            res.push(Instruction::DeleteBlob { blob: blob.clone() });
        }
    }
    res
}
