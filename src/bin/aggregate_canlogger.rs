use canlog_features::{
    config_from_env, init_logging, logging_config_from_env, BatchOutcome, SubjectProcessor,
    SubjectStatus,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = config_from_env()?;
    let processor = SubjectProcessor::new(cfg)?;
    let outcome = processor.run_batch()?;

    let failed = outcome
        .reports()
        .iter()
        .filter(|r| matches!(r.status, SubjectStatus::Failed { .. }))
        .count();

    match &outcome {
        BatchOutcome::Dataset { table, path, reports } => println!(
            "Aggregated {} windows from {} subjects ({} failed) into {}",
            table.len(),
            reports.len(),
            failed,
            path.display()
        ),
        BatchOutcome::NoData { reports } => println!(
            "No subject produced aggregated data ({} subjects, {} failed)",
            reports.len(),
            failed
        ),
    }

    Ok(())
}
