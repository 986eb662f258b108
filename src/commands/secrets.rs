//! `rigger secrets`: inspect and rotate generated secrets

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use converge::StateLock;
use keystore::Generator;

use super::{Session, confirm};
use crate::manifest::StepKind;
use crate::{Context, progress, ui};

pub fn list(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx)?;
    let infos = session.secrets.list()?;

    ui::header("Secrets");
    ui::kv("Store", &session.secrets.dir().display().to_string());
    println!();

    let declared = declared(&session);
    if infos.is_empty() && declared.is_empty() {
        ui::info("No secrets declared or stored");
        return Ok(());
    }

    for info in &infos {
        let public = if info.has_public { " +public" } else { "" };
        println!(
            "  {} {} {}",
            "✓".green(),
            info.name.bold(),
            format!(
                "{}{} created {}",
                info.generator,
                public,
                info.created_at.format("%Y-%m-%d %H:%M")
            )
            .dimmed()
        );
    }
    for (name, generator) in &declared {
        if infos.iter().any(|i| &i.name == name) {
            continue;
        }
        println!("  {} {} {}", "·".dimmed(), name, format!("{} not generated yet", generator).dimmed());
    }
    Ok(())
}

pub fn rotate(ctx: &Context, name: &str, force: bool, yes: bool) -> Result<()> {
    let session = Session::open(ctx)?;
    let generator = match declared(&session).into_iter().find(|(n, _)| n == name) {
        Some((_, generator)) => generator,
        None => match session.secrets.list()?.into_iter().find(|i| i.name == name) {
            Some(info) => info.generator,
            None => bail!("Secret '{}' is neither declared in the manifest nor stored", name),
        },
    };

    // A run in progress may be reading the secret
    let _lock = StateLock::try_acquire(&session.state_dir)
        .with_context(|| format!("Failed to lock {}", session.state_dir.display()))?;

    let exists = session.secrets.exists(name)?;
    if exists && !force {
        bail!(
            "Secret '{}' already exists; pass --force to regenerate it (services using it must be updated)",
            name
        );
    }
    if exists && !confirm(&format!("Regenerate secret '{}'?", name), yes)? {
        ui::info("Rotation cancelled");
        return Ok(());
    }

    let pb = progress::spinner(&format!("Generating {} ({})...", name, generator));
    match session.secrets.rotate(name, &generator, force) {
        Ok(_) => progress::finish_success(&pb, &format!("Secret '{}' regenerated", name)),
        Err(e) => {
            progress::finish_error(&pb, &format!("Failed to regenerate '{}'", name));
            return Err(e.into());
        }
    }
    ui::dim("Steps rendering this secret will re-run on the next apply");
    Ok(())
}

/// Secrets declared by `secret` steps, with their generators
fn declared(session: &Session) -> Vec<(String, Generator)> {
    session
        .manifest
        .steps
        .iter()
        .filter_map(|decl| match &decl.kind {
            StepKind::Secret(spec) => Some((spec.secret_name(&decl.name), spec.generator.clone())),
            _ => None,
        })
        .collect()
}
