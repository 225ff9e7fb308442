use crate::types::{ActionKind, AnalysisReport, PageSnapshot, TrajectoryLabel};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Parse and validate the page-understanding output.
///
/// Tasks must carry a selector, except `navigate` tasks which carry a
/// `url` parameter instead.
pub fn parse_analysis(json: &str) -> Result<AnalysisReport, ParseError> {
    let report: AnalysisReport = serde_json::from_str(json)?;
    for task in &report.frontier_tasks {
        match task.action {
            ActionKind::Navigate => {
                let has_url = task
                    .parameters
                    .get("url")
                    .and_then(|v| v.as_str())
                    .is_some_and(|u| !u.is_empty());
                if !has_url && task.selector.is_empty() {
                    return Err(ParseError::Invalid(format!(
                        "navigate task {} has neither a url parameter nor a selector",
                        task.id
                    )));
                }
            }
            _ if task.selector.trim().is_empty() => {
                return Err(ParseError::Invalid(format!(
                    "{} task {} has an empty selector",
                    task.action, task.id
                )));
            }
            _ => {}
        }
    }
    Ok(report)
}

/// Parse the trajectory-judgment output. Confidence must lie in `[0, 1]`.
pub fn parse_label(json: &str) -> Result<TrajectoryLabel, ParseError> {
    let label: TrajectoryLabel = serde_json::from_str(json)?;
    if !(0.0..=1.0).contains(&label.confidence) {
        return Err(ParseError::Invalid(format!(
            "confidence {} outside [0, 1]",
            label.confidence
        )));
    }
    Ok(label)
}

pub fn parse_snapshot(json: &str) -> Result<PageSnapshot, ParseError> {
    Ok(serde_json::from_str(json)?)
}
