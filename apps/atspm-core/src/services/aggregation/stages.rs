use crate::config::{AggregationName, AggregationRequest, ProcessorConfig};
use std::collections::BTreeSet;

/// A relation a stage reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageInput {
    RawData,
    /// Raw events unioned with the unmatched-events supplement.
    AllEvents,
    DetectorConfig,
    DeviceGroups,
    Output(AggregationName),
}

/// Declared inputs of one aggregation.
pub fn inputs(name: AggregationName, remove_incomplete: bool) -> Vec<StageInput> {
    use AggregationName as N;
    let mut out = match name {
        N::HasData | N::Actuations | N::Communications | N::Terminations | N::DetectorFaults => {
            vec![StageInput::RawData]
        }
        N::Timeline | N::UnmatchedEvents => vec![StageInput::AllEvents, StageInput::RawData],
        N::SplitFailures | N::YellowRed | N::ArrivalOnGreen => {
            vec![StageInput::RawData, StageInput::DetectorConfig]
        }
        N::DetectorHealth => vec![
            StageInput::Output(N::Actuations),
            StageInput::Output(N::HasData),
            StageInput::Output(N::DetectorFaults),
            StageInput::DeviceGroups,
        ],
    };
    if remove_incomplete && filters_on_completeness(name) {
        out.push(StageInput::Output(N::HasData));
    }
    out.sort();
    out.dedup();
    out
}

/// Tables restricted to complete bins when `remove_incomplete` is set.
pub fn filters_on_completeness(name: AggregationName) -> bool {
    !matches!(
        name,
        AggregationName::HasData | AggregationName::Timeline | AggregationName::UnmatchedEvents
    )
}

/// Aggregations whose output `name` reads.
pub fn dependencies(name: AggregationName, remove_incomplete: bool) -> Vec<AggregationName> {
    inputs(name, remove_incomplete)
        .into_iter()
        .filter_map(|input| match input {
            StageInput::Output(dep) => Some(dep),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub request: AggregationRequest,
    /// False for stages pulled in only to satisfy a dependency; their tables are not saved.
    pub requested: bool,
}

impl PlannedStep {
    pub fn name(&self) -> AggregationName {
        self.request.name()
    }
}

/// Execution order: requested order, with every dependency placed before its first consumer.
pub fn plan(config: &ProcessorConfig) -> Vec<PlannedStep> {
    let mut placed = BTreeSet::new();
    let mut steps = Vec::new();
    for request in &config.aggregations {
        visit(request.name(), config, &mut placed, &mut steps);
    }
    steps
}

fn visit(
    name: AggregationName,
    config: &ProcessorConfig,
    placed: &mut BTreeSet<AggregationName>,
    steps: &mut Vec<PlannedStep>,
) {
    if placed.contains(&name) {
        return;
    }
    // The graph is acyclic and shallow; mark first so a dependency never revisits its consumer.
    placed.insert(name);
    for dep in dependencies(name, config.remove_incomplete) {
        visit(dep, config, placed, steps);
    }
    let (request, requested) = match config.request(name) {
        Some(request) => (request.clone(), true),
        None => (AggregationRequest::implicit(name), false),
    };
    steps.push(PlannedStep { request, requested });
}
