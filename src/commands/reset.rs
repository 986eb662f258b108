//! `rigger reset`: forget recorded completion so steps re-run

use anyhow::{Context as _, Result};
use converge::StateStore;

use super::{Session, confirm};
use crate::{Context, ui};

pub fn run(ctx: &Context, step: Option<&str>, yes: bool) -> Result<()> {
    let session = Session::open(ctx)?;
    let mut store = StateStore::open_locked(&session.state_dir)
        .with_context(|| format!("Failed to open state in {}", session.state_dir.display()))?;

    let prompt = match step {
        Some(name) => {
            if store.record().get(name).is_none() {
                ui::info(&format!("No record for '{}'", name));
                return Ok(());
            }
            format!("Forget the recorded state of '{}'?", name)
        }
        None => {
            if store.record().steps.is_empty() {
                ui::info("State record is already empty");
                return Ok(());
            }
            format!("Forget the recorded state of all {} steps?", store.record().steps.len())
        }
    };
    if !confirm(&prompt, yes)? {
        ui::info("Reset cancelled");
        return Ok(());
    }

    store.forget(step)?;
    match step {
        Some(name) => ui::success(&format!("'{}' will be re-evaluated on the next apply", name)),
        None => ui::success("Every step will be re-evaluated on the next apply"),
    }
    Ok(())
}
