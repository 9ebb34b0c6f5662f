//! Sequential instruction execution against the init system.

use std::sync::Arc;

use tracing::{debug, error};

use super::{Instruction, ProvisionError};
use crate::systemd::{SystemdConnection, UnitCommand};

/// Executes one pod's instruction batch in phase order.
///
/// Execution is strictly sequential within a batch so the ordering
/// invariants hold; batches for different pods may run concurrently on
/// separate tasks. The first failing instruction aborts the remainder of
/// the batch.
pub struct Executor {
    conn: Arc<dyn SystemdConnection>,
}

impl Executor {
    pub fn new(conn: Arc<dyn SystemdConnection>) -> Self {
        Self { conn }
    }

    pub async fn execute(
        &self,
        pod: &str,
        mut batch: Vec<Instruction>,
    ) -> Result<(), ProvisionError> {
        // stable sort: emission order is preserved within a phase
        batch.sort_by_key(Instruction::phase);
        for instruction in &batch {
            debug!(pod, %instruction, "executing");
            if let Err(err) = self.step(instruction).await {
                error!(pod, %instruction, error = %err, "instruction failed, aborting batch");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn step(&self, instruction: &Instruction) -> Result<(), ProvisionError> {
        match instruction {
            Instruction::WriteUnit { unit_file } => {
                unit_file.write()?;
                self.conn.reload().await?;
            }
            Instruction::EnableUnit { unit_file } => {
                self.conn
                    .enable_unit_files(
                        &[unit_file.path.display().to_string()],
                        unit_file.runtime,
                    )
                    .await?;
            }
            Instruction::DisableUnit { unit_file, .. } => {
                self.conn
                    .disable_unit_files(&[unit_file.unit_name()], unit_file.runtime)
                    .await?;
            }
            Instruction::Command {
                unit_file, command, ..
            } => {
                let command: UnitCommand = command.parse()?;
                self.conn
                    .run_command(command, &unit_file.unit_name())
                    .await?;
            }
            Instruction::DeleteUnit { unit_file } => {
                unit_file.remove()?;
                self.conn.reload().await?;
            }
            Instruction::WriteBlob { blob } => blob.write()?,
            Instruction::DeleteBlob { blob } => blob.remove()?,
        }
        Ok(())
    }
}
