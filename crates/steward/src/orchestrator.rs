// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The per-host update loop.

use crate::context::CycleContext;
use crate::integrity::IntegrityReport;
use crate::reclaim::ReclaimReport;
use crate::requests::RequestReport;
use crate::retry::with_retry;
use crate::tape::{CallbackReport, TapeReport};
use crate::{Result, Steward};
use catalog::StorageNode;
use diagnostics::{log_debug, log_error, log_info, log_warn};
use std::future::Future;
use std::time::{Duration, Instant};

/// What one node's update did. Steps that did not run are `None`.
#[derive(Debug, Clone, Default)]
pub struct NodeOutcome {
    pub node: String,
    /// Why the node was passed over, if it was.
    pub skipped: Option<&'static str>,
    pub avail_gb: Option<f64>,
    pub integrity: Option<IntegrityReport>,
    pub reclaim: Option<ReclaimReport>,
    pub requests: Option<RequestReport>,
    pub tape_inbound: Option<TapeReport>,
    pub tape_outbound: Option<TapeReport>,
}

impl NodeOutcome {
    fn new(node: &StorageNode) -> Self {
        Self {
            node: node.name.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub callbacks: Option<CallbackReport>,
    pub nodes: Vec<NodeOutcome>,
    /// Nodes whose update ended in an error, with the error text.
    pub failed: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl Steward {
    /// Bring one node up to date.
    pub async fn update_node(
        &self,
        node: &StorageNode,
        ctx: &mut CycleContext,
    ) -> Result<NodeOutcome> {
        let mut outcome = NodeOutcome::new(node);

        if node.is_tape() {
            outcome.tape_inbound = Some(self.tape_inbound(node).await?);
            return Ok(outcome);
        }

        if !node.active {
            log_debug!("Skipping inactive node {node}", node: node.name.as_str());
            outcome.skipped = Some("inactive");
            return Ok(outcome);
        }

        let mut node = node.clone();
        match self.refresh_free_space(&node).await {
            Ok(avail_gb) => node.avail_gb = Some(avail_gb),
            Err(e) => log_error!(
                "Could not measure free space on {node}: {error}",
                node: node.name.as_str(),
                error: e.to_string()
            ),
        }
        outcome.avail_gb = node.avail_gb;

        if node.suspect {
            log_warn!("Node {node} is suspect; leaving its files alone", node: node.name.as_str());
            outcome.skipped = Some("suspect");
            return Ok(outcome);
        }

        outcome.integrity = Some(self.check_integrity(&node).await?);
        outcome.reclaim = Some(self.reclaim_space(&node).await?);
        outcome.requests = Some(self.process_requests(&node, ctx).await?);
        outcome.tape_outbound = Some(self.tape_outbound(&node).await?);
        Ok(outcome)
    }

    /// One pass over every node on this host. A failing node is logged and
    /// the pass moves on to the next.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut ctx = CycleContext::new();
        let mut report = CycleReport::default();

        match self.ingest_callbacks().await {
            Ok(callbacks) => report.callbacks = Some(callbacks),
            Err(e) => log_error!("Tape callback ingestion failed: {error}", error: e.to_string()),
        }

        let store = self.store.as_ref();
        let host = self.config.host.as_str();
        let nodes = with_retry(&self.config.retry, "node enumeration", || async move {
            store.nodes_on_host(host).await
        })
        .await?;
        if nodes.is_empty() {
            log_warn!(
                "No nodes on host {host}",
                host: host
            );
        }

        for node in &nodes {
            log_debug!("Updating node {node}", node: node.name.as_str());
            match self.update_node(node, &mut ctx).await {
                Ok(outcome) => report.nodes.push(outcome),
                Err(e) => {
                    log_error!(
                        "Update of node {node} failed: {error}",
                        node: node.name.as_str(),
                        error: e.to_string()
                    );
                    report.failed.push((node.name.clone(), e.to_string()));
                }
            }
        }

        report.elapsed = ctx.started().elapsed();
        Ok(report)
    }

    /// Run cycles until `shutdown` resolves, starting a new cycle at most
    /// once per cycle period. Shutdown is only observed between cycles.
    pub async fn run_forever<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        log_info!(
            "Starting update loop on {host}",
            host: self.config.host.as_str()
        );
        loop {
            let started = Instant::now();
            match self.run_cycle().await {
                Ok(report) => log_info!(
                    "Cycle finished: {nodes} nodes updated, {failed} failed in {seconds} seconds",
                    nodes: report.nodes.len(),
                    failed: report.failed.len(),
                    seconds: format!("{:.1}", report.elapsed.as_secs_f64())
                ),
                Err(e) => log_error!("Update cycle failed: {error}", error: e.to_string()),
            }

            let remaining = self.config.cycle_period().saturating_sub(started.elapsed());
            let pause = if remaining > Duration::from_secs(1) {
                remaining
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    log_info!("Update loop stopped");
                    return;
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}
