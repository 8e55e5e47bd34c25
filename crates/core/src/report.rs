//! # Report
//!
//! Markdown rendering of the final artifacts.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pipeline::Stage;
use crate::services::ReportRenderer;
use crate::state::io::write_file;
use crate::state::{AdaptPayload, CheckpointStore, ClusterPayload, StrategizePayload};

pub const REPORT_FILE: &str = "report.md";

#[derive(Debug, Clone, Default)]
pub struct MarkdownReportRenderer;

fn sentiment_label(score: Option<f32>) -> &'static str {
    match score {
        Some(s) if s > 0.2 => "positive",
        Some(s) if s < -0.2 => "negative",
        Some(_) => "neutral",
        None => "-",
    }
}

impl ReportRenderer for MarkdownReportRenderer {
    fn render(
        &self,
        adapt: &AdaptPayload,
        clusters: Option<&ClusterPayload>,
        strategy: Option<&StrategizePayload>,
    ) -> String {
        // Writing into a String cannot fail
        let mut out = String::new();

        match strategy {
            Some(s) => {
                let _ = writeln!(out, "# Chat analysis for {}\n", s.user_name);
            }
            None => out.push_str("# Chat analysis\n\n"),
        }
        let _ = writeln!(
            out,
            "Chats analysed: **{}** · topics found: **{}**\n",
            adapt.total_chats, adapt.total_topics
        );

        out.push_str("## Main topics\n\n");
        out.push_str("| # | Topic | Share | Sentiment | Chats | Keywords |\n");
        out.push_str("|---|-------|-------|-----------|-------|----------|\n");
        for (idx, topic) in adapt.aggregated.iter().enumerate() {
            let _ = writeln!(
                out,
                "| {} | {} | {:.1}% | {} | {} | {} |",
                idx + 1,
                topic.name,
                topic.percentage,
                sentiment_label(topic.sentiment),
                topic.source_chats.len(),
                topic.keywords.join(", ")
            );
        }
        out.push('\n');

        if let Some(clusters) = clusters {
            let _ = writeln!(out, "## Topic clusters ({})\n", clusters.k);
            for cluster in &clusters.clusters {
                let _ = writeln!(
                    out,
                    "- **{}** ({}): {}",
                    cluster.label,
                    cluster.topics.len(),
                    cluster.topics.join(", ")
                );
            }
            out.push('\n');
        }

        if !adapt.monetization_hints.is_empty() {
            out.push_str("## Monetization hints\n\n");
            for hint in &adapt.monetization_hints {
                let _ = writeln!(out, "- {}", hint);
            }
            out.push('\n');
        }

        if let Some(strategy) = strategy {
            let document = &strategy.document;
            out.push_str("## Strategy\n\n");
            if !document.summary.is_empty() {
                let _ = writeln!(out, "{}\n", document.summary);
            }
            if let Some(key) = &document.transformation_key {
                let _ = writeln!(out, "**Key direction:** {}\n", key);
            }
            for opportunity in &document.opportunities {
                let _ = writeln!(
                    out,
                    "### {} ({} potential)\n",
                    opportunity.topic,
                    opportunity.commercial_potential.as_str()
                );
                if !opportunity.realistic_revenue.is_empty() {
                    let _ = writeln!(out, "Realistic revenue: {}\n", opportunity.realistic_revenue);
                }
                if !opportunity.methods.is_empty() {
                    out.push_str("Methods:\n");
                    for method in &opportunity.methods {
                        let _ = writeln!(out, "- {}", method);
                    }
                    out.push('\n');
                }
                if !opportunity.first_steps.is_empty() {
                    out.push_str("First steps:\n");
                    for (idx, step) in opportunity.first_steps.iter().enumerate() {
                        let _ = writeln!(out, "{}. {}", idx + 1, step);
                    }
                    out.push('\n');
                }
            }
        }

        out
    }
}

/// Render the latest Adapt, Cluster and Strategize checkpoints into
/// `<output_dir>/report.md`.
pub async fn write_report(
    renderer: &dyn ReportRenderer,
    store: &CheckpointStore,
    output_dir: &Path,
) -> Result<PathBuf> {
    let adapt = store
        .get(Stage::Adapt, None)
        .context("No merged analysis to report on")?;
    let clusters = store.get(Stage::Cluster, None).ok();
    let strategy = store.get(Stage::Strategize, None).ok();

    let markdown = renderer.render(
        adapt.as_adapt()?,
        clusters.as_ref().map(|a| a.as_cluster()).transpose()?,
        strategy.as_ref().map(|a| a.as_strategize()).transpose()?,
    );

    let path = write_file(output_dir.join(REPORT_FILE), &markdown).await?;
    tracing::info!(path = ?path, "Report written");
    Ok(path)
}
