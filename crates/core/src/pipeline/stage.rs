//! # Pipeline Stages
//!
//! The fixed, ordered set of stages and the per-stage state machine the
//! orchestrator drives for one run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One step of the analysis pipeline, in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Read raw messages from the message source
    Collect,
    /// Per-chat topic, sentiment and monetization analysis
    Analyze,
    /// Merge per-chat analyses into one normalized view
    Adapt,
    /// Embed and cluster topics
    Cluster,
    /// Build the monetization strategy document
    Strategize,
}

/// Whether a stage writes one artifact per chat or a single merged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    PerChat,
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Collect,
        Stage::Analyze,
        Stage::Adapt,
        Stage::Cluster,
        Stage::Strategize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Analyze => "analyze",
            Stage::Adapt => "adapt",
            Stage::Cluster => "cluster",
            Stage::Strategize => "strategize",
        }
    }

    /// Stages whose artifacts this stage consumes.
    pub fn inputs(&self) -> &'static [Stage] {
        match self {
            Stage::Collect => &[],
            Stage::Analyze => &[Stage::Collect],
            Stage::Adapt => &[Stage::Analyze],
            Stage::Cluster => &[Stage::Adapt],
            Stage::Strategize => &[Stage::Adapt, Stage::Cluster],
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Stage::Collect | Stage::Analyze => Granularity::PerChat,
            Stage::Adapt | Stage::Cluster | Stage::Strategize => Granularity::Aggregate,
        }
    }

    pub fn is_per_chat(&self) -> bool {
        self.granularity() == Granularity::PerChat
    }

    /// Kind of artifact the stage produces.
    pub fn output_kind(&self) -> &'static str {
        match self {
            Stage::Collect => "raw_messages",
            Stage::Analyze => "chat_analysis",
            Stage::Adapt => "merged_analysis",
            Stage::Cluster => "topic_clusters",
            Stage::Strategize => "strategy_document",
        }
    }

    /// Every stage strictly before this one.
    pub fn upstream(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(move |s| s < self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "collect" => Ok(Stage::Collect),
            "analyze" | "analyse" => Ok(Stage::Analyze),
            "adapt" => Ok(Stage::Adapt),
            "cluster" => Ok(Stage::Cluster),
            "strategize" | "strategy" => Ok(Stage::Strategize),
            other => Err(format!(
                "unknown stage '{}' (expected one of collect, analyze, adapt, cluster, strategize)",
                other
            )),
        }
    }
}

/// Per-run state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not evaluated yet
    #[default]
    Pending,
    /// Valid checkpoints found, nothing executed
    Skipped,
    /// Runner invoked, not yet returned
    Running,
    /// Runner returned and checkpoints were written
    Done,
    /// Mandatory output absent; the run ends here
    Failed,
}

impl StageState {
    pub fn can_transition_to(&self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Skipped) | (Pending, Running) | (Pending, Failed) | (Running, Done) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Skipped | StageState::Done | StageState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "PENDING",
            StageState::Skipped => "SKIPPED",
            StageState::Running => "RUNNING",
            StageState::Done => "DONE",
            StageState::Failed => "FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Collect < Stage::Analyze);
        assert!(Stage::Cluster < Stage::Strategize);
        let upstream: Vec<_> = Stage::Cluster.upstream().collect();
        assert_eq!(upstream, vec![Stage::Collect, Stage::Analyze, Stage::Adapt]);
    }

    #[test]
    fn test_inputs_are_upstream() {
        for stage in Stage::ALL {
            for input in stage.inputs() {
                assert!(*input < stage, "{} consumes {}", stage, input);
            }
        }
        assert_eq!(Stage::Strategize.inputs(), &[Stage::Adapt, Stage::Cluster]);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("Cluster".parse::<Stage>(), Ok(Stage::Cluster));
        assert_eq!("analyse".parse::<Stage>(), Ok(Stage::Analyze));
        assert!("report".parse::<Stage>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        assert!(StageState::Pending.can_transition_to(StageState::Running));
        assert!(StageState::Running.can_transition_to(StageState::Done));
        assert!(!StageState::Done.can_transition_to(StageState::Running));
        assert!(!StageState::Skipped.can_transition_to(StageState::Failed));
    }

    #[test]
    fn test_granularity() {
        assert!(Stage::Analyze.is_per_chat());
        assert!(!Stage::Adapt.is_per_chat());
    }
}
