use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use flora::config::PipelineConfig;
use flora::jobs::{RecursionPlan, UnitJob};
use flora::phase::PhaseName;
use flora::recursion::{DispatchGroup, GroupingThresholds, decompose};
use flora::resources::{ResourcePredictor, ResourceRequest};
use flora::units::{WorkUnit, total_size};

pub fn cmd_plan(config_path: &Path, units: &str, phase: &str, oversize: bool) -> Result<()> {
    let config = PipelineConfig::load_or_default(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let phase: PhaseName = phase.parse()?;
    let Some(plan) = RecursionPlan::for_phase(phase) else {
        bail!("Phase '{}' does not walk the work tree", phase);
    };

    let units = parse_units(units)?;
    let total = total_size(&units);
    let thresholds = GroupingThresholds::resolve(&config, phase, plan.recursion)?;
    let groups = decompose(&units, &thresholds)?;
    let predictor = ResourcePredictor::new(Arc::new(config));

    let recursion = predictor.estimate(&UnitJob::new(plan.recursion, units.clone(), oversize), total)?;
    println!(
        "Phase {} ({}): memory {}, cpu {}",
        phase,
        plan.recursion,
        recursion.describe_memory(),
        describe_cpu(&recursion)
    );
    println!(
        "Thresholds: min_unit_size={} max_group_size={} max_secondary_group_size={}",
        thresholds.min_unit_size, thresholds.max_group_size, thresholds.max_secondary_group_size
    );
    println!();

    println!(
        "{:<6} {:<9} {:<24} {:>10}  {:<26} {:>10}",
        "GROUP", "TYPE", "UNITS", "SIZE", "JOB", "MEMORY"
    );
    println!("{}", "-".repeat(92));
    for (index, group) in groups.iter().enumerate() {
        let kind = plan.wrapper.kind_for(group.is_oversize());
        let job = UnitJob::new(kind, group.units().to_vec(), group.is_oversize());
        let request = predictor.estimate(&job, total)?;
        let ids: Vec<String> = group.units().iter().map(|u| u.id.to_string()).collect();
        println!(
            "{:<6} {:<9} {:<24} {:>10}  {:<26} {:>10}",
            index + 1,
            group_type(group),
            ids.join(","),
            group.total_size(),
            kind.name(),
            request.describe_memory()
        );
    }

    let grouped: HashSet<u64> = groups
        .iter()
        .flat_map(|g| g.units().iter().map(|u| u.id))
        .collect();
    let dropped: Vec<String> = units
        .iter()
        .filter(|u| !grouped.contains(&u.id))
        .map(|u| u.id.to_string())
        .collect();
    if !dropped.is_empty() {
        println!();
        println!(
            "Dropped below min_unit_size {}: {}",
            thresholds.min_unit_size,
            dropped.join(",")
        );
    }

    Ok(())
}

fn group_type(group: &DispatchGroup) -> &'static str {
    match group {
        DispatchGroup::Batch(_) => "batch",
        DispatchGroup::Oversize(_) => "oversize",
    }
}

fn describe_cpu(request: &ResourceRequest) -> String {
    match request.cpu {
        Some(cpu) => format!("{}", cpu),
        None => "-".to_string(),
    }
}

/// Parse `"id:size,id:size"`.
fn parse_units(spec: &str) -> Result<Vec<WorkUnit>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, size) = entry
                .split_once(':')
                .with_context(|| format!("Expected id:size, got '{}'", entry))?;
            let id = id
                .trim()
                .parse()
                .with_context(|| format!("Invalid unit id in '{}'", entry))?;
            let size = size
                .trim()
                .parse()
                .with_context(|| format!("Invalid unit size in '{}'", entry))?;
            Ok(WorkUnit::new(id, size))
        })
        .collect()
}
